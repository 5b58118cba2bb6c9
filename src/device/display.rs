use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{DeviceError, Orientation, Result};

/// A display output that can be rotated
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayTarget {
    pub index: usize,
    pub name: String,
    pub current_orientation: Orientation,
}

/// Platform display-rotation backend
#[async_trait::async_trait]
pub trait DisplayActuator: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<DisplayTarget>>;

    /// Returns whether the backend accepted the change
    async fn set_orientation(&self, index: usize, orientation: Orientation) -> Result<bool>;
}

/// In-memory display set that records every rotation request
pub struct VirtualDisplay {
    targets: Mutex<Vec<DisplayTarget>>,
    calls: Mutex<Vec<(usize, Orientation)>>,
}

impl VirtualDisplay {
    pub fn new(count: usize) -> Self {
        let targets = (0..count)
            .map(|index| DisplayTarget {
                index,
                name: format!("Display {}", index + 1),
                current_orientation: Orientation::default(),
            })
            .collect();
        Self {
            targets: Mutex::new(targets),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every `set_orientation` call so far, in order
    pub async fn calls(&self) -> Vec<(usize, Orientation)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl DisplayActuator for VirtualDisplay {
    async fn list_targets(&self) -> Result<Vec<DisplayTarget>> {
        Ok(self.targets.lock().await.clone())
    }

    async fn set_orientation(&self, index: usize, orientation: Orientation) -> Result<bool> {
        self.calls.lock().await.push((index, orientation));
        let mut targets = self.targets.lock().await;
        match targets.get_mut(index) {
            Some(target) => {
                log::info!("{} rotated to {}", target.name, orientation);
                target.current_orientation = orientation;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Pushes session orientations to the display backend
#[derive(Clone)]
pub struct OrientationApplier {
    display: Arc<dyn DisplayActuator>,
}

impl OrientationApplier {
    pub fn new(display: Arc<dyn DisplayActuator>) -> Self {
        Self { display }
    }

    pub fn display(&self) -> &Arc<dyn DisplayActuator> {
        &self.display
    }

    /// Check that `index` names a currently known target
    pub async fn validate_target(&self, index: usize) -> Result<()> {
        let count = self.display.list_targets().await?.len();
        if index >= count {
            return Err(DeviceError::TargetOutOfRange { index, count });
        }
        Ok(())
    }

    /// Apply `orientation` to target `index`.
    ///
    /// An out-of-range index is rejected before the backend is touched.
    pub async fn apply(&self, address: &str, index: usize, orientation: Orientation) -> Result<()> {
        self.validate_target(index).await?;
        if self.display.set_orientation(index, orientation).await? {
            log::info!("Applied orientation {} from {} to target {}", orientation, address, index);
            Ok(())
        } else {
            Err(DeviceError::Display(format!("target {} rejected orientation {}", index, orientation)))
        }
    }
}
