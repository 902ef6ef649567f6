use crate::device::GraphicsDevice;
use crate::frame::FrameState;
use crate::gpu::{DescriptorSlot, DeviceError, GpuDescriptorHandle, MemoryKind, ResourceDesc, ResourceId, ResourceState};
use crate::resource::{self, Residency, ResidencyState};
use bytemuck::Pod;
use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

/// Read-only array of fixed-size elements, viewed as `StructuredBuffer<T>`.
pub struct StructuredBuffer {
    label: String,
    element_size: u32,
    element_count: u32,
    residency: RefCell<Residency>,
}

impl StructuredBuffer {
    /// Stages `data` and queues its upload.
    pub fn new(
        device: &mut GraphicsDevice,
        label: &str,
        data: &[u8],
        element_size: u32,
        element_count: u32,
    ) -> Result<Rc<Self>, DeviceError> {
        let size = element_size as u64 * element_count as u64;
        if size == 0 || data.len() as u64 != size {
            return Err(DeviceError::InvalidArgument(format!(
                "{label}: {} bytes for {element_count} elements of {element_size} bytes",
                data.len()
            )));
        }
        let desc = ResourceDesc::Buffer {
            size,
            memory: MemoryKind::DeviceLocal,
        };
        let upload = resource::stage(device, &desc, label, data)?;
        let buffer = Rc::new(Self {
            label: label.to_owned(),
            element_size,
            element_count,
            residency: RefCell::new(Residency::Pending(upload)),
        });

        let queued = Rc::clone(&buffer);
        device.enqueue(Box::new(move |device| queued.upload(device)));
        Ok(buffer)
    }

    pub fn from_slice<T: Pod>(device: &mut GraphicsDevice, label: &str, items: &[T]) -> Result<Rc<Self>, DeviceError> {
        Self::new(
            device,
            label,
            bytemuck::cast_slice(items),
            std::mem::size_of::<T>() as u32,
            items.len() as u32,
        )
    }

    /// Records the staging copy and creates the view. Does nothing once the
    /// buffer is resident.
    pub fn upload(&self, device: &mut GraphicsDevice) -> Result<(), DeviceError> {
        let mut residency = self.residency.borrow_mut();
        let Residency::Pending(upload) = *residency else {
            return Ok(());
        };
        device.expect_phase(FrameState::Recording, "StructuredBuffer::upload")?;

        let size = self.element_size as u64 * self.element_count as u64;
        let backend = device.backend_mut();
        backend.copy_buffer(upload.resource, upload.staging, size);
        backend.transition_resource(upload.resource, ResourceState::CopyDest, ResourceState::PixelShaderResource);
        backend.create_buffer_view(upload.resource, self.element_size, self.element_count, upload.slot.cpu)?;
        residency.finish_upload(device, upload);
        debug!("uploaded buffer {} ({size} bytes)", self.label);
        Ok(())
    }

    pub(crate) fn release(&self, device: &mut GraphicsDevice) {
        self.residency.borrow_mut().release(device);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn state(&self) -> ResidencyState {
        self.residency.borrow().state()
    }

    pub fn is_resident(&self) -> bool {
        self.state() == ResidencyState::Resident
    }

    pub fn descriptor(&self) -> Option<GpuDescriptorHandle> {
        self.residency.borrow().descriptor()
    }

    pub fn slot(&self) -> Option<DescriptorSlot> {
        self.residency.borrow().slot()
    }

    pub fn resource(&self) -> Option<ResourceId> {
        self.residency.borrow().resource()
    }

    pub fn staging_bytes(&self) -> u64 {
        self.residency.borrow().staging_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{headless_device, run_frame_with};
    use crate::gpu::headless::{Command, ViewRecord};
    use rstest::rstest;

    fn copies_into(commands: &[Command], resource: ResourceId) -> Vec<u64> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::CopyBuffer { dst, size, .. } if *dst == resource => Some(*size),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn slice_becomes_a_structured_view_after_one_frame() {
        let (mut device, probe) = headless_device();
        let buffer = StructuredBuffer::from_slice(&mut device, "weights", &[1.0f32, 2.0, 3.0]).unwrap();
        assert_eq!((buffer.element_size(), buffer.element_count()), (4, 3));
        assert_eq!(buffer.state(), ResidencyState::Pending);
        assert_eq!(buffer.staging_bytes(), 12);

        run_frame_with(&mut device, |_| Ok(()));

        assert!(buffer.is_resident());
        assert_eq!(buffer.staging_bytes(), 0);
        let resource = buffer.resource().unwrap();
        assert_eq!(copies_into(&probe.commands(), resource), vec![12]);
        assert_eq!(
            probe.view_at(buffer.slot().unwrap().cpu),
            Some(ViewRecord::Buffer {
                resource,
                element_size: 4,
                element_count: 3,
            })
        );
    }

    #[test]
    fn upload_runs_once() {
        let (mut device, probe) = headless_device();
        let buffer = StructuredBuffer::from_slice(&mut device, "biases", &[0u32; 8]).unwrap();
        let resource = buffer.resource().unwrap();

        device.pre_render().unwrap();
        buffer.upload(&mut device).unwrap();
        // The queued copy of the same upload now does nothing.
        device.render().unwrap();
        buffer.upload(&mut device).unwrap();

        assert_eq!(copies_into(&probe.commands(), resource), vec![32]);
    }

    #[test]
    fn upload_outside_a_frame_is_rejected() {
        let (mut device, _probe) = headless_device();
        let buffer = StructuredBuffer::from_slice(&mut device, "early", &[7u16; 2]).unwrap();
        assert!(matches!(
            buffer.upload(&mut device),
            Err(DeviceError::InvalidPhase { .. })
        ));
        assert_eq!(buffer.state(), ResidencyState::Pending);
    }

    #[rstest]
    #[case(&[], 4, 0)]
    #[case(&[0; 8], 0, 2)]
    #[case(&[0; 8], 4, 3)]
    #[case(&[0; 12], 4, 2)]
    fn size_mismatch_is_rejected(#[case] data: &[u8], #[case] element_size: u32, #[case] element_count: u32) {
        let (mut device, probe) = headless_device();
        let alive = probe.live_resources();
        let result = StructuredBuffer::new(&mut device, "bad", data, element_size, element_count);
        assert!(matches!(result, Err(DeviceError::InvalidArgument(_))));
        assert_eq!(probe.live_resources(), alive);
        assert_eq!(device.queued_commands(), 2);
    }
}
