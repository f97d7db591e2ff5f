use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Broadcaster, ResultAnnouncement};

struct Client {
    tx: mpsc::UnboundedSender<String>,
    /// 为空表示接收所有进程
    processes: HashSet<String>,
}

type Clients = Arc<Mutex<HashMap<u64, Client>>>;

/// WebSocket 结果广播器。
///
/// 在本地启动 WebSocket 服务器，把每条执行结果推送给已连接的客户端。
///
/// # 协议
///
/// **服务端 → 客户端**：[`ResultAnnouncement`] 的 JSON
/// ```json
/// { "process_id": "...", "message_id": "...", "nonce": 3, "timestamp": 1700, "result": { "Error": null, "Output": ... } }
/// ```
///
/// **客户端 → 服务端**（可选）：只订阅部分进程
/// ```json
/// { "subscribe": ["<process_id>", "..."] }
/// ```
pub struct WebSocketBroadcaster {
    clients: Clients,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

#[derive(Deserialize)]
struct ClientRequest {
    #[serde(default)]
    subscribe: Vec<String>,
}

impl WebSocketBroadcaster {
    /// 绑定端口并启动服务器；`port == 0` 时由系统分配
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let clients: Clients = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let clients_bg = clients.clone();
        let shutdown_bg = shutdown.clone();
        let next_id = Arc::new(AtomicU64::new(0));

        tokio::spawn(async move {
            info!("📡 结果广播服务器已启动: ws://{local_addr}");
            loop {
                tokio::select! {
                    _ = shutdown_bg.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!("新的 WebSocket 客户端连接: {addr}");
                            let id = next_id.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(handle_connection(stream, addr, id, clients_bg.clone()));
                        }
                        Err(e) => {
                            error!("WebSocket accept 错误: {e}");
                        }
                    }
                }
            }
            info!("结果广播服务器已停止");
        });

        Ok(Self {
            clients,
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    /// 停止接受新连接，断开现有客户端
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        lock(&self.clients).clear();
    }
}

impl Drop for WebSocketBroadcaster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Broadcaster for WebSocketBroadcaster {
    /// 推送给订阅了该进程的客户端，自动清理失效连接
    fn publish(&self, announcement: ResultAnnouncement) {
        let msg = match serde_json::to_string(&announcement) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("结果序列化失败: {e}");
                return;
            }
        };
        let mut clients = lock(&self.clients);
        clients.retain(|_, client| {
            if !client.processes.is_empty() && !client.processes.contains(&announcement.process_id)
            {
                return true;
            }
            client.tx.send(msg.clone()).is_ok()
        });
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    id: u64,
    clients: Clients,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket 握手失败 ({addr}): {e}");
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    lock(&clients).insert(
        id,
        Client {
            tx,
            processes: HashSet::new(),
        },
    );

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(Message::Text(msg)).await {
                warn!("WS 消息发送失败: {e}");
                break;
            }
        }
    });

    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientRequest>(&text) {
                Ok(request) => {
                    if let Some(client) = lock(&clients).get_mut(&id) {
                        debug!(client = %addr, processes = ?request.subscribe, "更新订阅");
                        client.processes = request.subscribe.into_iter().collect();
                    }
                }
                Err(e) => {
                    warn!("WebSocket 消息解析失败: {e}，原始内容: {text}");
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    lock(&clients).remove(&id);
    write_task.abort();
    info!("WebSocket 客户端断开: {addr}");
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
