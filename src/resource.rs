//! Residency bookkeeping shared by textures and structured buffers.

use crate::device::GraphicsDevice;
use crate::gpu::{DescriptorSlot, DeviceError, GpuDescriptorHandle, MemoryKind, ResourceDesc, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyState {
    /// Staging filled and upload queued; no view yet.
    Pending,
    Resident,
    Released,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StagedUpload {
    pub resource: ResourceId,
    pub staging: ResourceId,
    pub staging_bytes: u64,
    pub slot: DescriptorSlot,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Residency {
    Pending(StagedUpload),
    Resident { resource: ResourceId, slot: DescriptorSlot },
    Released,
}

impl Residency {
    pub fn state(&self) -> ResidencyState {
        match self {
            Residency::Pending(_) => ResidencyState::Pending,
            Residency::Resident { .. } => ResidencyState::Resident,
            Residency::Released => ResidencyState::Released,
        }
    }

    pub fn descriptor(&self) -> Option<GpuDescriptorHandle> {
        match self {
            Residency::Resident { slot, .. } => Some(slot.gpu),
            _ => None,
        }
    }

    pub fn slot(&self) -> Option<DescriptorSlot> {
        match self {
            Residency::Pending(upload) => Some(upload.slot),
            Residency::Resident { slot, .. } => Some(*slot),
            Residency::Released => None,
        }
    }

    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            Residency::Pending(upload) => Some(upload.resource),
            Residency::Resident { resource, .. } => Some(*resource),
            Residency::Released => None,
        }
    }

    pub fn staging_bytes(&self) -> u64 {
        match self {
            Residency::Pending(upload) => upload.staging_bytes,
            _ => 0,
        }
    }

    /// Marks the upload done and hands the staging buffer to retirement.
    pub fn finish_upload(&mut self, device: &mut GraphicsDevice, upload: StagedUpload) {
        device.retire(vec![upload.staging], None, upload.staging_bytes);
        *self = Residency::Resident {
            resource: upload.resource,
            slot: upload.slot,
        };
    }

    /// Moves to `Released`, queueing everything still owned for retirement.
    pub fn release(&mut self, device: &mut GraphicsDevice) {
        match std::mem::replace(self, Residency::Released) {
            Residency::Pending(upload) => {
                device.retire(vec![upload.resource, upload.staging], Some(upload.slot), upload.staging_bytes)
            }
            Residency::Resident { resource, slot } => device.retire(vec![resource], Some(slot), 0),
            Residency::Released => {}
        }
    }
}

/// Creates the device-local resource and a filled staging buffer, and
/// reserves a descriptor slot for the view.
pub(crate) fn stage(
    device: &mut GraphicsDevice,
    desc: &ResourceDesc,
    label: &str,
    staging_data: &[u8],
) -> Result<StagedUpload, DeviceError> {
    let staging_bytes = staging_data.len() as u64;
    let backend = device.backend_mut();
    let resource = backend.create_resource(desc, label)?;
    let staging = match backend.create_resource(
        &ResourceDesc::Buffer {
            size: staging_bytes,
            memory: MemoryKind::Upload,
        },
        &format!("{label} (staging)"),
    ) {
        Ok(staging) => staging,
        Err(e) => {
            backend.release_resource(resource);
            return Err(e);
        }
    };

    let slot = backend
        .write_resource(staging, 0, staging_data)
        .and_then(|()| device.allocate_descriptor());
    match slot {
        Ok(slot) => Ok(StagedUpload {
            resource,
            staging,
            staging_bytes,
            slot,
        }),
        Err(e) => {
            let backend = device.backend_mut();
            backend.release_resource(staging);
            backend.release_resource(resource);
            Err(e)
        }
    }
}
