use crate::conversation::{ ConversationController, ReplyGenerator, SendOutcome };
use crate::models::websocket::{ ClientMessage, ServerMessage };
use crate::voice::{ VoiceConfig, VoiceEvent, VoiceSession };
use super::auth::{ self, Identity };
use super::ServerContext;

use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::sync::mpsc;

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ Request, Response, ErrorResponse };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_rustls::TlsAcceptor;

use rustls::ServerConfig;
use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls_pemfile::{ certs, pkcs8_private_keys };

use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use chrono::Utc;
use log::{ debug, info, warn, error };
use futures::{ SinkExt, StreamExt };

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
}

pub(crate) fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let mut keys = pkcs8_private_keys(&mut key_reader);
    let key = match keys.next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

pub async fn start_ws_server(
    addr: &str,
    context: ServerContext
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    let args = &context.args;

    let protocol = if args.enable_tls && args.tls_cert_path.is_some() && args.tls_key_path.is_some() {
        "wss"
    } else {
        "ws"
    };
    info!("{} server listening on: {}", protocol.to_uppercase(), addr);

    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                let config = load_tls_config(cert_path, key_path)?;
                Some(TlsAcceptor::from(config))
            }
            (Some(_), None) | (None, Some(_)) => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
            (None, None) => {
                error!("--enable-tls was set but no certificate/key paths provided.");
                return Err("TLS enabled without cert/key".into());
            }
        }
    } else {
        info!("TLS not enabled. Running plain WebSocket (WS) server.");
        None
    };

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let context_clone = context.clone();
        let tls_acceptor_clone = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor_clone {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(peer, tls_stream, context_clone).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, context_clone).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

fn unauthorized(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    context: ServerContext
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let secret = context.args.server_api_key.clone();
    let mut identity: Option<Identity> = None;

    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let params = auth::parse_query(req.uri().query().unwrap_or(""));
        match auth::authenticate(&params, secret.as_deref(), Utc::now().timestamp()) {
            Ok(who) => {
                identity = Some(who);
                Ok(response)
            }
            Err(e) => {
                warn!("Rejected handshake from {}: {}", peer, e);
                Err(unauthorized(e.to_string()))
            }
        }
    };

    let ws = match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            return Err(Box::new(e) as _);
        }
    };

    match identity {
        Some(identity) => {
            handle_connection(peer, ws, context, identity).await;
            Ok(())
        }
        None => Err("Handshake completed without an identity".into()),
    }
}

fn send(out_tx: &mpsc::UnboundedSender<ServerMessage>, message: ServerMessage) {
    if out_tx.send(message).is_err() {
        debug!("Outgoing channel closed, dropping frame");
    }
}

/// Runs one chat send off the read loop so voice frames keep flowing.
fn spawn_chat(
    controller: Arc<ConversationController>,
    out_tx: mpsc::UnboundedSender<ServerMessage>,
    content: String
) {
    tokio::spawn(async move {
        match controller.send(&content).await {
            SendOutcome::Replied { user, reply } => {
                send(&out_tx, ServerMessage::UserMessage { message: user });
                send(&out_tx, ServerMessage::Response { message: reply });
            }
            SendOutcome::Failed { user, reply, error } => {
                warn!("Chat reply failed for {}: {}", controller.user_id(), error);
                send(&out_tx, ServerMessage::UserMessage { message: user });
                send(&out_tx, ServerMessage::Response { message: reply });
            }
            SendOutcome::Rejected => {
                debug!("Ignoring empty or concurrent chat message from {}", controller.user_id());
            }
            SendOutcome::Discarded => {
                debug!("Chat reply for {} arrived after a clear", controller.user_id());
            }
        }
    });
}

async fn handle_client_message(
    message: ClientMessage,
    controller: &Arc<ConversationController>,
    voice: &mut VoiceSession,
    out_tx: &mpsc::UnboundedSender<ServerMessage>
) {
    match message {
        ClientMessage::Chat { content } => {
            if content.trim().is_empty() || controller.is_loading() {
                debug!("Chat message ignored (empty or already processing)");
                return;
            }
            send(out_tx, ServerMessage::Processing);
            spawn_chat(Arc::clone(controller), out_tx.clone(), content);
        }
        ClientMessage::Clear => {
            match controller.clear().await {
                Ok(removed) => {
                    info!("Cleared {} messages for {}", removed, controller.user_id());
                    send(out_tx, ServerMessage::Cleared { removed });
                }
                Err(e) => {
                    error!("Failed to clear history for {}: {}", controller.user_id(), e);
                    send(out_tx, ServerMessage::Error { message: format!("Failed to clear history: {}", e) });
                }
            }
        }
        ClientMessage::History => {
            send(out_tx, ServerMessage::History { messages: controller.messages() });
        }
        other => {
            voice.handle_client_message(&other);
        }
    }
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    context: ServerContext,
    identity: Identity
)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    info!(
        "New WebSocket connection: {} (user {}, email {})",
        peer,
        identity.user_id,
        identity.email.as_deref().unwrap_or("-")
    );

    let (mut ws_tx, mut ws_rx) = websocket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                debug!("Failed to send frame to {}: {}", peer, e);
                break;
            }
        }
    });

    let agent = Arc::clone(&context.agent);
    let generator: Arc<dyn ReplyGenerator> = agent.clone();
    let controller = Arc::new(
        ConversationController::new(identity.user_id.clone(), generator, Some(agent.history_store()))
    );
    match controller.load_history().await {
        Ok(_) => send(&out_tx, ServerMessage::History { messages: controller.messages() }),
        Err(e) => {
            error!("Failed to load history for {}: {}", identity.user_id, e);
            send(&out_tx, ServerMessage::Error { message: "Failed to load history".to_string() });
        }
    }

    let prompts = agent.prompt_config();
    let voice_config = VoiceConfig {
        silence_timeout: Duration::from_secs(context.args.silence_timeout_secs),
        lang: prompts.text("speech_lang").to_string(),
        error_text: prompts.text("voice_error").to_string(),
    };
    let (mut voice, mut voice_events) = VoiceSession::new(
        Arc::clone(&controller),
        context.tts.clone(),
        voice_config,
        out_tx.clone()
    );

    loop {
        tokio::select! {
            Some(event) = voice_events.recv() => {
                voice.handle(event);
            }
            incoming = ws_rx.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        match e {
                            | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                            | tokio_tungstenite::tungstenite::Error::Protocol(_)
                            | tokio_tungstenite::tungstenite::Error::Utf8 => {
                                info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                            }
                            tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                                io_err.kind() == std::io::ErrorKind::ConnectionReset
                            => {
                                info!("WebSocket connection reset by peer {}", peer);
                            }
                            _ => {
                                error!("Error receiving message from {}: {}", peer, e);
                            }
                        }
                        break;
                    }
                    None => break,
                };

                if message.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds size limit ({} > {})",
                        peer,
                        message.len(),
                        MAX_MESSAGE_SIZE
                    );
                    send(&out_tx, ServerMessage::Error { message: "Message too large".to_string() });
                    break;
                }

                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_message) => {
                                handle_client_message(client_message, &controller, &mut voice, &out_tx).await;
                            }
                            Err(e) => {
                                error!("Failed to parse message from {}: {}", peer, e);
                                send(&out_tx, ServerMessage::Error {
                                    message: format!("Failed to parse message: {}", e),
                                });
                            }
                        }
                    }
                    Message::Close(_) => {
                        info!("Received close frame from {}", peer);
                        break;
                    }
                    Message::Binary(_) => {
                        warn!("Ignoring binary message from {}", peer);
                    }
                    // Pings are answered by tungstenite.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
        }
    }

    if voice.is_active() {
        voice.handle(VoiceEvent::Stop);
    }
    drop(voice);
    drop(out_tx);
    if let Err(e) = writer.await {
        debug!("Writer task for {} ended abnormally: {}", peer, e);
    }
    info!("WebSocket connection closed for {} (user {})", peer, identity.user_id);
}
