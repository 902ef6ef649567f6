use crate::gpu::{
    DeviceError, GeometryBinding, GpuBackend, MemoryKind, ResourceDesc, ResourceId, VertexAttribute, VertexFormat,
};
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ScreenVertex {
    pub position: Vec3,
    pub uv: Vec2,
}

/// One oversized triangle covering the viewport; UVs reach 0..1 on screen.
pub const FULL_SCREEN_VERTICES: [ScreenVertex; 3] = [
    ScreenVertex {
        position: Vec3::new(-1.0, 1.0, 0.0),
        uv: Vec2::new(0.0, 0.0),
    },
    ScreenVertex {
        position: Vec3::new(3.0, 1.0, 0.0),
        uv: Vec2::new(2.0, 0.0),
    },
    ScreenVertex {
        position: Vec3::new(-1.0, -3.0, 0.0),
        uv: Vec2::new(0.0, 2.0),
    },
];

/// Both windings of the triangle so it survives either cull mode.
pub const FULL_SCREEN_INDICES: [u16; 6] = [0, 1, 2, 0, 2, 1];

pub const SCREEN_VERTEX_LAYOUT: [VertexAttribute; 2] = [
    VertexAttribute {
        semantic: "POSITION",
        format: VertexFormat::Float32x3,
        offset: 0,
    },
    VertexAttribute {
        semantic: "TEXCOORD",
        format: VertexFormat::Float32x2,
        offset: 12,
    },
];

/// Vertex and index buffers shared by every full-screen draw. They live in
/// upload memory and are never rewritten.
pub struct FullScreenGeometry {
    vertex_buffer: ResourceId,
    index_buffer: ResourceId,
}

impl FullScreenGeometry {
    pub fn new(backend: &mut dyn GpuBackend) -> Result<Self, DeviceError> {
        let vertices: &[u8] = bytemuck::cast_slice(&FULL_SCREEN_VERTICES);
        let indices: &[u8] = bytemuck::cast_slice(&FULL_SCREEN_INDICES);

        let vertex_buffer = backend.create_resource(
            &ResourceDesc::Buffer {
                size: vertices.len() as u64,
                memory: MemoryKind::Upload,
            },
            "FullScreenVertices",
        )?;
        backend.write_resource(vertex_buffer, 0, vertices)?;
        let index_buffer = backend.create_resource(
            &ResourceDesc::Buffer {
                size: indices.len() as u64,
                memory: MemoryKind::Upload,
            },
            "FullScreenIndices",
        )?;
        backend.write_resource(index_buffer, 0, indices)?;

        Ok(Self {
            vertex_buffer,
            index_buffer,
        })
    }

    pub fn binding(&self) -> GeometryBinding {
        GeometryBinding {
            vertex_buffer: self.vertex_buffer,
            vertex_stride: std::mem::size_of::<ScreenVertex>() as u32,
            vertex_bytes: std::mem::size_of_val(&FULL_SCREEN_VERTICES) as u32,
            index_buffer: self.index_buffer,
            index_bytes: std::mem::size_of_val(&FULL_SCREEN_INDICES) as u32,
        }
    }

    pub fn index_count(&self) -> u32 {
        FULL_SCREEN_INDICES.len() as u32
    }

    pub fn release(&self, backend: &mut dyn GpuBackend) {
        backend.release_resource(self.vertex_buffer);
        backend.release_resource(self.index_buffer);
    }
}
