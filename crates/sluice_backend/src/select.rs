//! Physical device selection

use crate::caps::CapabilitySet;
use crate::driver::QueueFamily;
use crate::error::BackendError;
use tracing::debug;

/// Queue family chosen for each role. Roles may share a family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub compute: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// First family offering each role. Present is only looked up when needed.
    pub fn find(families: &[QueueFamily], need_present: bool) -> Self {
        let first = |role: fn(&QueueFamily) -> bool| {
            families
                .iter()
                .position(|family| family.queue_count > 0 && role(family))
                .map(|index| index as u32)
        };
        Self {
            graphics: first(|f| f.graphics),
            compute: first(|f| f.compute),
            present: if need_present { first(|f| f.present) } else { None },
        }
    }

    /// `None` unless every needed role has a family.
    pub fn resolve(&self, need_present: bool) -> Option<QueueRoles> {
        Some(QueueRoles {
            graphics: self.graphics?,
            compute: self.compute?,
            present: if need_present { Some(self.present?) } else { None },
        })
    }

    pub fn is_complete(&self, need_present: bool) -> bool {
        self.resolve(need_present).is_some()
    }
}

/// A complete queue family assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRoles {
    pub graphics: u32,
    pub compute: u32,
    pub present: Option<u32>,
}

impl QueueRoles {
    /// Distinct families in ascending order; one queue is created per entry.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.compute];
        families.extend(self.present);
        families.sort_unstable();
        families.dedup();
        families
    }
}

/// What selection needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate<P> {
    pub handle: P,
    pub name: String,
    pub extensions: CapabilitySet,
    pub queue_families: Vec<QueueFamily>,
}

#[derive(Debug, Clone)]
pub struct Selected<P> {
    pub handle: P,
    pub queues: QueueRoles,
    /// Position in the raw enumeration.
    pub enumeration_index: usize,
}

/// Keeps candidates supporting every required extension and a complete
/// queue assignment, then picks `index` from the survivors in enumeration order.
pub fn select_device<P>(
    candidates: Vec<DeviceCandidate<P>>,
    required: &CapabilitySet,
    need_present: bool,
    index: usize,
) -> Result<Selected<P>, BackendError> {
    if candidates.is_empty() {
        return Err(BackendError::NoPhysicalDevices);
    }
    let total = candidates.len();

    let mut suitable: Vec<Selected<P>> = candidates
        .into_iter()
        .enumerate()
        .filter_map(|(position, candidate)| {
            let missing: Vec<&String> = required.difference(&candidate.extensions).collect();
            let found = QueueFamilyIndices::find(&candidate.queue_families, need_present);
            debug!(
                "Device {position} '{}': missing extensions {missing:?}, queues {found:?}",
                candidate.name
            );
            let queues = found.resolve(need_present).filter(|_| missing.is_empty())?;
            Some(Selected {
                handle: candidate.handle,
                queues,
                enumeration_index: position,
            })
        })
        .collect();

    if suitable.is_empty() {
        return Err(BackendError::NoSuitableDevices { candidates: total });
    }
    if index >= suitable.len() {
        return Err(BackendError::DeviceIndexOutOfRange {
            index,
            suitable: suitable.len(),
        });
    }
    Ok(suitable.swap_remove(index))
}
