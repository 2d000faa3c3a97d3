// 播放管线：解封装、包队列、解码线程与会话

pub mod decoder;
pub mod demuxer;
pub mod engine;
pub mod interrupter;
pub mod manager;
pub mod packet_queue;
pub mod queue;
pub mod recording;
pub mod worker;

pub use decoder::{AudioDecoder, AudioFrameQueue, AvSync, SubtitleDecoder, VideoDecoder};
pub use demuxer::Demuxer;
pub use engine::{CodecContext, Container, MediaEngine, SeekDirection};
pub use interrupter::{AbortReason, Interrupter, OperationKind};
pub use manager::PlaybackSession;
pub use packet_queue::{BufferState, PacketQueue};
pub use queue::BoundedQueue;
pub use recording::{MemorySink, RecordingSink};
