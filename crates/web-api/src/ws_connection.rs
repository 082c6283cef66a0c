use std::sync::Arc;

use application::{OutboundFrame, SessionAttributes};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{ConnectionId, Envelope, InboundOperation, OutboundEvent, UserId};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::AppState;

/// WebSocket 连接
///
/// 握手已经完成，主体已写入会话属性。连接内部分两个任务：
/// - 发送任务：把投递引擎的下行队列和本地写命令写到 socket
/// - 接收任务：解析上行帧，逐帧交给会话网关
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
    subject: UserId,
    session: Arc<SessionAttributes>,
    connection_id: ConnectionId,
}

impl WebSocketConnection {
    pub fn new(
        socket: WebSocket,
        state: AppState,
        subject: UserId,
        session: Arc<SessionAttributes>,
    ) -> Self {
        Self {
            socket,
            state,
            subject,
            session,
            connection_id: ConnectionId::random(),
        }
    }

    /// 运行连接主循环，任一方向结束即断开并清理会话
    pub async fn run(self) {
        let Self {
            socket,
            state,
            subject,
            session,
            connection_id,
        } = self;

        let mut frames = state.gateway.open_session(subject, connection_id);
        let (mut sender, mut incoming) = socket.split();

        // 本地写命令：格式错误回执、pong 等不经过投递引擎
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        let mut send_task = tokio::spawn(async move {
            loop {
                let outgoing = tokio::select! {
                    frame = frames.recv() => match frame {
                        Some(frame) => match encode_frame(&frame) {
                            Some(text) => WsMessage::Text(text.into()),
                            None => continue,
                        },
                        // 队列被摘除：被新连接顶替或被清扫
                        None => {
                            let _ = sender.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        WsCommand::SendText(text) => WsMessage::Text(text.into()),
                        WsCommand::SendPong(data) => WsMessage::Pong(data.into()),
                    },
                };
                if sender.send(outgoing).await.is_err() {
                    tracing::warn!(connection_id = %connection_id, "failed to write websocket frame");
                    break;
                }
            }
        });

        let recv_state = state.clone();
        let mut recv_task = tokio::spawn(async move {
            while let Some(Ok(message)) = incoming.next().await {
                let inbound = InboundContext {
                    state: &recv_state,
                    subject,
                    session: &session,
                    cmd_tx: &cmd_tx,
                };
                if inbound.handle(message).await.is_err() {
                    break;
                }
            }
        });

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        state.gateway.close_session(subject, connection_id);
    }
}

/// 接收任务处理单个上行帧需要的上下文
struct InboundContext<'a> {
    state: &'a AppState,
    subject: UserId,
    session: &'a Arc<SessionAttributes>,
    cmd_tx: &'a mpsc::Sender<WsCommand>,
}

impl InboundContext<'_> {
    /// 返回 `Err` 表示连接应当结束
    async fn handle(&self, message: WsMessage) -> Result<(), ()> {
        match message {
            WsMessage::Close(_) => {
                tracing::debug!(user_id = %self.subject, "client closed connection");
                return Err(());
            }
            WsMessage::Ping(data) => {
                self.state.gateway.record_activity(self.subject);
                self.command(WsCommand::SendPong(data.to_vec())).await?;
            }
            WsMessage::Pong(_) => {
                self.state.gateway.record_activity(self.subject);
            }
            WsMessage::Text(text) => {
                self.state.gateway.record_activity(self.subject);
                match serde_json::from_str::<InboundOperation>(text.as_str()) {
                    Ok(operation) => self.dispatch(operation),
                    Err(err) => {
                        tracing::debug!(user_id = %self.subject, error = %err, "malformed frame");
                        self.reply_error("BAD_REQUEST", format!("malformed frame: {err}"))
                            .await?;
                    }
                }
            }
            WsMessage::Binary(_) => {
                self.reply_error("BAD_REQUEST", "binary frames are not supported")
                    .await?;
            }
        }
        Ok(())
    }

    /// 每个操作独立执行，慢操作不阻塞后续帧的读取
    fn dispatch(&self, operation: InboundOperation) {
        let gateway = self.state.gateway.clone();
        let clock = self.state.clock.clone();
        let session = self.session.clone();
        let cmd_tx = self.cmd_tx.clone();
        let subject = self.subject;

        tokio::spawn(async move {
            if let Err(err) = gateway.dispatch(Some(subject), &session, operation).await {
                let event = OutboundEvent::error("AUTH_FAILED", err.to_string());
                if let Some(text) = encode_event(&event, clock.now()) {
                    let _ = cmd_tx.send(WsCommand::SendText(text)).await;
                }
            }
        });
    }

    async fn reply_error(&self, code: &str, reason: impl Into<String>) -> Result<(), ()> {
        let event = OutboundEvent::error(code, reason);
        match encode_event(&event, self.state.clock.now()) {
            Some(text) => self.command(WsCommand::SendText(text)).await,
            None => Ok(()),
        }
    }

    async fn command(&self, cmd: WsCommand) -> Result<(), ()> {
        self.cmd_tx.send(cmd).await.map_err(|_| {
            tracing::warn!(user_id = %self.subject, "websocket writer is gone");
        })
    }
}

fn encode_frame(frame: &OutboundFrame) -> Option<String> {
    match frame.to_text() {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::warn!(destination = %frame.destination, error = %err, "failed to serialize websocket payload");
            None
        }
    }
}

fn encode_event(event: &OutboundEvent, now: domain::Timestamp) -> Option<String> {
    match Envelope::wrap(event, now).and_then(|envelope| serde_json::to_string(&envelope)) {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize websocket payload");
            None
        }
    }
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendText(String),
    SendPong(Vec<u8>),
}
