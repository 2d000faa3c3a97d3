use thiserror::Error;

/// 引擎调用的结果分类
///
/// 管线从不解析码流内部，只对这几种结果做出反应：成功、稍后重试、结束、中断、失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("暂无数据，稍后重试")]
    Again,

    #[error("到达流末尾")]
    EndOfStream,

    #[error("操作被中断")]
    Interrupted,

    #[error("引擎错误: {0}")]
    Failed(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("引擎错误: {0}")]
    Engine(#[from] EngineError),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置解析错误: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("无效配置: {0}")]
    InvalidConfig(String),

    #[error("无法打开媒体: {0}")]
    OpenError(String),

    #[error("尚未打开")]
    NotOpened,

    #[error("无效的流索引: {0}")]
    InvalidStream(usize),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("渲染错误: {0}")]
    RenderError(String),

    #[error("录制错误: {0}")]
    RecordingError(String),

    /// 协作式中断信号，不是失败
    #[error("操作被中断")]
    Interrupted,

    #[error("Anyhow 错误: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

impl PipelineError {
    /// 是否为协作式中断（调用方应静默退出或重试，不记录为错误）
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            PipelineError::Interrupted | PipelineError::Engine(EngineError::Interrupted)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
