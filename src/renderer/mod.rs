// 渲染器：把解码后的画面转换为可呈现的图像
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::frame::{DecodedPicture, PresentableImage};
use crate::core::{PixelFormat, PipelineError, Result};

/// 视频解码器把每一帧交给渲染器，取回可呈现的图像句柄
pub trait Renderer: Send + Sync {
    fn submit(&self, picture: &DecodedPicture) -> Result<PresentableImage>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenderStats {
    pub frames_submitted: u64,
    /// 画面尺寸/格式变化导致的表面重建次数
    pub surface_recreations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Surface {
    width: u32,
    height: u32,
    format: PixelFormat,
}

/// CPU 渲染器：校验数据尺寸后直接引用画面数据（`Bytes` 共享，无拷贝）
#[derive(Debug, Default)]
pub struct CpuRenderer {
    next_id: AtomicU64,
    surface: Mutex<Option<Surface>>,
    stats: Mutex<RenderStats>,
}

impl CpuRenderer {
    pub fn new() -> Self {
        info!("🎨 初始化 CpuRenderer");
        Self::default()
    }

    pub fn stats(&self) -> RenderStats {
        *self.stats.lock()
    }
}

impl Renderer for CpuRenderer {
    fn submit(&self, picture: &DecodedPicture) -> Result<PresentableImage> {
        let expected = picture.format.frame_size(picture.width, picture.height);
        if picture.data.len() < expected {
            return Err(PipelineError::RenderError(format!(
                "画面数据不足: {}x{} {:?} 需要 {} 字节，实际 {}",
                picture.width,
                picture.height,
                picture.format,
                expected,
                picture.data.len()
            )));
        }

        let surface = Surface {
            width: picture.width,
            height: picture.height,
            format: picture.format,
        };
        let mut stats = self.stats.lock();
        {
            let mut current = self.surface.lock();
            if *current != Some(surface) {
                debug!("🆕 重建渲染表面: {}x{} {:?}", surface.width, surface.height, surface.format);
                *current = Some(surface);
                stats.surface_recreations += 1;
            }
        }
        stats.frames_submitted += 1;

        Ok(PresentableImage {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            data: Some(picture.data.clone()),
        })
    }
}
