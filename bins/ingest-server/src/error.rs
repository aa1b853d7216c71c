use ingest_api::ClientError;
use ingest_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("{section} backend: {source}")]
    Backend {
        section: &'static str,
        source: ClientError,
    },

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),

    #[error("api server: {0}")]
    Api(String),

    #[error("pipeline is unhealthy: {0}")]
    Fatal(String),
}

impl ServerError {
    pub fn backend(section: &'static str) -> impl FnOnce(ClientError) -> Self {
        move |source| ServerError::Backend { section, source }
    }
}
