//! GPU placement: weighted idle-first selection.

use crate::error::OrchestratorError;
use crate::model::{GpuState, WorkerImage};

/// Outcome of GPU selection for a job. `device_index = None` means CPU.
#[derive(Debug, Clone)]
pub struct GpuPlacement {
    pub device_index: Option<i32>,
    pub reason: String,
}

impl GpuPlacement {
    pub fn assigned(&self) -> String {
        match self.device_index {
            Some(index) => index.to_string(),
            None => "cpu".to_string(),
        }
    }
}

/// Pick a GPU for an image, or fall back to CPU where permitted.
///
/// Candidates are filtered by the image's VRAM floor, then scored with
/// `0.6 * vram_pressure + 0.4 * utilization`; the lowest score wins and
/// ties break on the lowest device index, so identical states always give
/// identical placements.
pub fn select_gpu(
    image: &WorkerImage,
    gpus: &[GpuState],
) -> Result<GpuPlacement, OrchestratorError> {
    if !image.requires_gpu {
        return Ok(GpuPlacement {
            device_index: None,
            reason: "image does not require a GPU".to_string(),
        });
    }

    let mut candidates: Vec<&GpuState> = gpus
        .iter()
        .filter(|gpu| gpu.available && gpu.free_vram_mb >= image.min_vram_mb)
        .collect();

    candidates.sort_by(|a, b| {
        a.scheduling_score()
            .partial_cmp(&b.scheduling_score())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.device_index.cmp(&b.device_index))
    });

    match candidates.first() {
        Some(gpu) => Ok(GpuPlacement {
            device_index: Some(gpu.device_index),
            reason: format!(
                "GPU {}: {} MB free of {} MB, {:.1}% utilization, {} active workers",
                gpu.device_index,
                gpu.free_vram_mb,
                gpu.total_vram_mb,
                gpu.utilization_percent,
                gpu.active_workers
            ),
        }),
        None if image.cpu_fallback => Ok(GpuPlacement {
            device_index: None,
            reason: format!(
                "no GPU with {} MB free VRAM, image permits CPU fallback",
                image.min_vram_mb
            ),
        }),
        None => Err(OrchestratorError::InsufficientVram {
            required_mb: image.min_vram_mb,
        }),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn image(requires_gpu: bool, min_vram_mb: i32, cpu_fallback: bool) -> WorkerImage {
        WorkerImage {
            id: Uuid::new_v4(),
            image: "dockhand/gpu-report".into(),
            tag: "latest".into(),
            description: String::new(),
            enabled: true,
            requires_gpu,
            cpu_fallback,
            min_vram_mb,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn gpu(index: i32, used: i32, total: i32, util: f64) -> GpuState {
        GpuState {
            id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            device_index: index,
            name: format!("GPU {}", index),
            total_vram_mb: total,
            used_vram_mb: used,
            free_vram_mb: total - used,
            utilization_percent: util,
            available: true,
            active_workers: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn idle_gpu_wins_under_pressure() {
        // GPU 0: 7/8 GB used at 90%; GPU 1: 1/8 GB used at 10%.
        let gpus = vec![gpu(0, 7168, 8192, 90.0), gpu(1, 1024, 8192, 10.0)];
        let placement = select_gpu(&image(true, 1024, false), &gpus).unwrap();
        assert_eq!(placement.device_index, Some(1));
    }

    #[test]
    fn vram_floor_fails_without_cpu_fallback() {
        // Best GPU has only 512 MB free.
        let gpus = vec![gpu(0, 7168, 8192, 90.0), gpu(1, 7680, 8192, 10.0)];
        let err = select_gpu(&image(true, 1024, false), &gpus).unwrap_err();
        assert_eq!(err.kind(), "insufficient_vram");
    }

    #[test]
    fn vram_floor_allows_cpu_when_image_permits() {
        let gpus = vec![gpu(0, 7680, 8192, 10.0)];
        let placement = select_gpu(&image(true, 1024, true), &gpus).unwrap();
        assert_eq!(placement.device_index, None);
        assert_eq!(placement.assigned(), "cpu");
    }

    #[test]
    fn ties_break_on_lowest_device_index() {
        let gpus = vec![gpu(1, 1024, 8192, 10.0), gpu(0, 1024, 8192, 10.0)];
        let placement = select_gpu(&image(true, 512, false), &gpus).unwrap();
        assert_eq!(placement.device_index, Some(0));
    }

    #[test]
    fn cpu_image_never_touches_gpus() {
        let gpus = vec![gpu(0, 0, 8192, 0.0)];
        let placement = select_gpu(&image(false, 0, false), &gpus).unwrap();
        assert_eq!(placement.device_index, None);
    }

    #[test]
    fn selection_is_deterministic_for_identical_states() {
        let gpus = vec![gpu(0, 4096, 8192, 50.0), gpu(1, 2048, 8192, 70.0)];
        let first = select_gpu(&image(true, 1024, false), &gpus).unwrap();
        let second = select_gpu(&image(true, 1024, false), &gpus).unwrap();
        assert_eq!(first.device_index, second.device_index);
    }
}
