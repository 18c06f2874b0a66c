pub mod api;
pub mod auth;
pub mod websocket;

use crate::agent::AIAgent;
use crate::cli::Args;
use crate::tts::SpeechSynthesizer;
use std::error::Error;
use std::sync::Arc;

/// Everything a connection or request handler needs.
#[derive(Clone)]
pub struct ServerContext {
    pub agent: Arc<AIAgent>,
    pub tts: Option<Arc<dyn SpeechSynthesizer>>,
    pub args: Args,
}

pub struct Server {
    addr: String,
    context: ServerContext,
}

impl Server {
    pub fn new(
        addr: String,
        agent: Arc<AIAgent>,
        tts: Option<Arc<dyn SpeechSynthesizer>>,
        args: Args
    ) -> Self {
        Self {
            addr,
            context: ServerContext { agent, tts, args },
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(http_port) = self.context.args.http_port {
            self.start_http_server(http_port).await?;
        }

        self.start_ws_server().await?;

        Ok(())
    }

    async fn start_http_server(&self, http_port: u16) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(http_port, self.context.clone()).await
    }

    async fn start_ws_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(&self.addr, self.context.clone()).await
    }
}
