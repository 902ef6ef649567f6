use super::{
    AddressMode, BindingLayoutDesc, CpuDescriptorHandle, DescriptorKind, DeviceError, GeometryBinding, GpuBackend,
    GpuDescriptorHandle, HeapInfo, LayoutId, MemoryKind, PipelineDesc, PipelineId, PresentStatus, ResourceDesc,
    ResourceId, ResourceState, SamplerFilter, ShaderError, ShaderId, ShaderSource, VertexFormat, FRAME_COUNT,
};
use crate::format::{SubresourceFootprint, TextureFormat};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::ffi::CString;
use std::mem::ManuallyDrop;
use windows::core::{Interface, HSTRING, PCSTR};
use windows::Win32::Foundation::*;
use windows::Win32::Graphics::Direct3D::Fxc::*;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::*;

const BACK_BUFFER_FORMAT: DXGI_FORMAT = DXGI_FORMAT_R8G8B8A8_UNORM;

fn native(call: &'static str) -> impl FnOnce(windows::core::Error) -> DeviceError {
    move |e| DeviceError::native(call, e.message())
}

pub struct Dx12Backend {
    device: ID3D12Device,
    command_queue: ID3D12CommandQueue,
    swapchain: IDXGISwapChain4,
    rtv_heap: ID3D12DescriptorHeap,
    rtv_descriptor_size: u32,
    render_targets: Vec<ID3D12Resource>,
    srv_heap: ID3D12DescriptorHeap,
    srv_capacity: u32,
    srv_descriptor_size: u32,
    command_allocators: Vec<ID3D12CommandAllocator>,
    command_list: ID3D12GraphicsCommandList,
    fence: ID3D12Fence,
    fence_event: HANDLE,
    next_id: u64,
    resources: HashMap<u64, ID3D12Resource>,
    shaders: HashMap<u64, ID3DBlob>,
    layouts: HashMap<u64, ID3D12RootSignature>,
    pipelines: HashMap<u64, ID3D12PipelineState>,
}

impl Dx12Backend {
    pub fn new(hwnd: HWND, width: u32, height: u32, descriptor_capacity: u32) -> Result<Self, DeviceError> {
        unsafe {
            let factory: IDXGIFactory4 =
                CreateDXGIFactory2(DXGI_CREATE_FACTORY_FLAGS(0)).map_err(native("CreateDXGIFactory2"))?;

            let adapter = get_hardware_adapter(&factory)?;
            let mut device: Option<ID3D12Device> = None;
            D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device).map_err(native("D3D12CreateDevice"))?;
            let device = device.ok_or_else(|| DeviceError::native("D3D12CreateDevice", "no device returned"))?;

            let command_queue: ID3D12CommandQueue = device
                .CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                    Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                    ..Default::default()
                })
                .map_err(native("CreateCommandQueue"))?;

            let swapchain_desc = DXGI_SWAP_CHAIN_DESC1 {
                Width: width,
                Height: height,
                Format: BACK_BUFFER_FORMAT,
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                BufferCount: FRAME_COUNT as u32,
                SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                ..Default::default()
            };
            let swapchain: IDXGISwapChain1 = factory
                .CreateSwapChainForHwnd(&command_queue, hwnd, &swapchain_desc, None, None)
                .map_err(native("CreateSwapChainForHwnd"))?;
            factory
                .MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER)
                .map_err(native("MakeWindowAssociation"))?;
            let swapchain: IDXGISwapChain4 = swapchain.cast().map_err(native("IDXGISwapChain4"))?;

            let rtv_heap: ID3D12DescriptorHeap = device
                .CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                    NumDescriptors: FRAME_COUNT as u32,
                    Type: D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
                    ..Default::default()
                })
                .map_err(native("CreateDescriptorHeap"))?;
            let rtv_descriptor_size = device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_RTV);
            let render_targets = create_render_targets(&device, &swapchain, &rtv_heap, rtv_descriptor_size)?;

            let srv_heap: ID3D12DescriptorHeap = device
                .CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                    NumDescriptors: descriptor_capacity,
                    Type: D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                    Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
                    ..Default::default()
                })
                .map_err(native("CreateDescriptorHeap"))?;
            let srv_descriptor_size = device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV);

            let mut command_allocators = Vec::with_capacity(FRAME_COUNT);
            for _ in 0..FRAME_COUNT {
                let allocator: ID3D12CommandAllocator = device
                    .CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)
                    .map_err(native("CreateCommandAllocator"))?;
                command_allocators.push(allocator);
            }

            let command_list: ID3D12GraphicsCommandList = device
                .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &command_allocators[0], None)
                .map_err(native("CreateCommandList"))?;
            command_list.Close().map_err(native("Close"))?;

            let fence: ID3D12Fence = device.CreateFence(0, D3D12_FENCE_FLAG_NONE).map_err(native("CreateFence"))?;
            let fence_event = CreateEventA(None, false, false, None).map_err(native("CreateEventA"))?;

            info!("D3D12 device ready: {width}x{height}, {descriptor_capacity} shader-visible descriptors");

            Ok(Self {
                device,
                command_queue,
                swapchain,
                rtv_heap,
                rtv_descriptor_size,
                render_targets,
                srv_heap,
                srv_capacity: descriptor_capacity,
                srv_descriptor_size,
                command_allocators,
                command_list,
                fence,
                fence_event,
                next_id: 0,
                resources: HashMap::new(),
                shaders: HashMap::new(),
                layouts: HashMap::new(),
                pipelines: HashMap::new(),
            })
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn resource(&self, id: ResourceId) -> Option<&ID3D12Resource> {
        let resource = self.resources.get(&id.0);
        if resource.is_none() {
            warn!("dx12: unknown resource {id:?}");
        }
        resource
    }

    fn rtv_handle(&self, back_buffer: usize) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        unsafe {
            D3D12_CPU_DESCRIPTOR_HANDLE {
                ptr: self.rtv_heap.GetCPUDescriptorHandleForHeapStart().ptr
                    + back_buffer * self.rtv_descriptor_size as usize,
            }
        }
    }
}

impl GpuBackend for Dx12Backend {
    fn name(&self) -> &'static str {
        "d3d12"
    }

    fn descriptor_heap(&self) -> HeapInfo {
        unsafe {
            HeapInfo {
                capacity: self.srv_capacity,
                cpu_start: CpuDescriptorHandle(self.srv_heap.GetCPUDescriptorHandleForHeapStart().ptr),
                gpu_start: GpuDescriptorHandle(self.srv_heap.GetGPUDescriptorHandleForHeapStart().ptr),
                increment: self.srv_descriptor_size,
            }
        }
    }

    fn back_buffer_format(&self) -> TextureFormat {
        TextureFormat::Rgba8Unorm
    }

    fn create_resource(&mut self, desc: &ResourceDesc, label: &str) -> Result<ResourceId, DeviceError> {
        let (heap_type, resource_desc, initial_state) = match *desc {
            ResourceDesc::Buffer { size, memory } => {
                let (heap, state) = match memory {
                    // Promoted to COPY_DEST by the first copy.
                    MemoryKind::DeviceLocal => (D3D12_HEAP_TYPE_DEFAULT, D3D12_RESOURCE_STATE_COMMON),
                    MemoryKind::Upload => (D3D12_HEAP_TYPE_UPLOAD, D3D12_RESOURCE_STATE_GENERIC_READ),
                };
                let desc = D3D12_RESOURCE_DESC {
                    Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                    Width: size,
                    Height: 1,
                    DepthOrArraySize: 1,
                    MipLevels: 1,
                    SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                    Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                    ..Default::default()
                };
                (heap, desc, state)
            }
            ResourceDesc::Texture2D {
                width,
                height,
                mip_levels,
                format,
            } => {
                let desc = D3D12_RESOURCE_DESC {
                    Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
                    Width: width as u64,
                    Height: height,
                    DepthOrArraySize: 1,
                    MipLevels: mip_levels as u16,
                    Format: DXGI_FORMAT(format.dxgi() as i32),
                    SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                    Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
                    ..Default::default()
                };
                (D3D12_HEAP_TYPE_DEFAULT, desc, D3D12_RESOURCE_STATE_COPY_DEST)
            }
        };

        let resource = unsafe {
            let mut resource: Option<ID3D12Resource> = None;
            self.device
                .CreateCommittedResource(
                    &D3D12_HEAP_PROPERTIES {
                        Type: heap_type,
                        ..Default::default()
                    },
                    D3D12_HEAP_FLAG_NONE,
                    &resource_desc,
                    initial_state,
                    None,
                    &mut resource,
                )
                .map_err(native("CreateCommittedResource"))?;
            resource.ok_or_else(|| DeviceError::native("CreateCommittedResource", format!("no resource for '{label}'")))?
        };

        // Shows up in PIX captures and debug-layer messages.
        unsafe {
            let _ = resource.SetName(&HSTRING::from(label));
        }

        let id = self.next_id();
        self.resources.insert(id, resource);
        debug!("dx12: created '{label}' as resource {id}");
        Ok(ResourceId(id))
    }

    fn write_resource(&mut self, resource: ResourceId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let target = self
            .resources
            .get(&resource.0)
            .ok_or_else(|| DeviceError::native("Map", format!("unknown resource {resource:?}")))?;
        unsafe {
            let mut mapped: *mut std::ffi::c_void = std::ptr::null_mut();
            target.Map(0, None, Some(&mut mapped)).map_err(native("Map"))?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), (mapped as *mut u8).add(offset as usize), data.len());
            target.Unmap(0, None);
        }
        Ok(())
    }

    fn release_resource(&mut self, resource: ResourceId) {
        if self.resources.remove(&resource.0).is_none() {
            warn!("dx12: release of unknown resource {resource:?}");
        }
    }

    fn create_texture_view(
        &mut self,
        resource: ResourceId,
        format: TextureFormat,
        mip_levels: u32,
        slot: CpuDescriptorHandle,
    ) -> Result<(), DeviceError> {
        let texture = self
            .resources
            .get(&resource.0)
            .ok_or_else(|| DeviceError::native("CreateShaderResourceView", format!("unknown resource {resource:?}")))?;
        unsafe {
            self.device.CreateShaderResourceView(
                texture,
                Some(&D3D12_SHADER_RESOURCE_VIEW_DESC {
                    Format: DXGI_FORMAT(format.dxgi() as i32),
                    ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
                    Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                    Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                        Texture2D: D3D12_TEX2D_SRV {
                            MipLevels: mip_levels,
                            ..Default::default()
                        },
                    },
                }),
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: slot.0 },
            );
        }
        Ok(())
    }

    fn create_buffer_view(
        &mut self,
        resource: ResourceId,
        element_size: u32,
        element_count: u32,
        slot: CpuDescriptorHandle,
    ) -> Result<(), DeviceError> {
        let buffer = self
            .resources
            .get(&resource.0)
            .ok_or_else(|| DeviceError::native("CreateShaderResourceView", format!("unknown resource {resource:?}")))?;
        unsafe {
            self.device.CreateShaderResourceView(
                buffer,
                Some(&D3D12_SHADER_RESOURCE_VIEW_DESC {
                    Format: DXGI_FORMAT_UNKNOWN,
                    ViewDimension: D3D12_SRV_DIMENSION_BUFFER,
                    Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                    Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                        Buffer: D3D12_BUFFER_SRV {
                            FirstElement: 0,
                            NumElements: element_count,
                            StructureByteStride: element_size,
                            Flags: D3D12_BUFFER_SRV_FLAG_NONE,
                        },
                    },
                }),
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: slot.0 },
            );
        }
        Ok(())
    }

    fn create_constant_view(&mut self, resource: ResourceId, size: u32, slot: CpuDescriptorHandle) -> Result<(), DeviceError> {
        let buffer = self
            .resources
            .get(&resource.0)
            .ok_or_else(|| DeviceError::native("CreateConstantBufferView", format!("unknown resource {resource:?}")))?;
        unsafe {
            self.device.CreateConstantBufferView(
                Some(&D3D12_CONSTANT_BUFFER_VIEW_DESC {
                    BufferLocation: buffer.GetGPUVirtualAddress(),
                    SizeInBytes: size,
                }),
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: slot.0 },
            );
        }
        Ok(())
    }

    fn compile_shader(&mut self, source: &ShaderSource<'_>) -> Result<ShaderId, ShaderError> {
        let compile_error = |diagnostics: String| ShaderError::Compile {
            file: source.name.to_owned(),
            diagnostics,
        };
        let cstr = |s: &str| CString::new(s).map_err(|e| compile_error(e.to_string()));

        let name = cstr(source.name)?;
        let entry = cstr(source.entry_point)?;
        let target = cstr(source.target)?;
        let define_strings = source
            .defines
            .iter()
            .map(|&(k, v)| Ok((cstr(k)?, cstr(v)?)))
            .collect::<Result<Vec<_>, ShaderError>>()?;
        let mut macros: Vec<D3D_SHADER_MACRO> = define_strings
            .iter()
            .map(|(k, v)| D3D_SHADER_MACRO {
                Name: PCSTR(k.as_ptr() as *const u8),
                Definition: PCSTR(v.as_ptr() as *const u8),
            })
            .collect();
        macros.push(D3D_SHADER_MACRO {
            Name: PCSTR::null(),
            Definition: PCSTR::null(),
        });

        let blob = unsafe {
            let mut blob = None;
            let mut error = None;
            let result = D3DCompile(
                source.text.as_ptr() as *const std::ffi::c_void,
                source.text.len(),
                PCSTR(name.as_ptr() as *const u8),
                Some(macros.as_ptr()),
                None,
                PCSTR(entry.as_ptr() as *const u8),
                PCSTR(target.as_ptr() as *const u8),
                D3DCOMPILE_OPTIMIZATION_LEVEL3,
                0,
                &mut blob,
                Some(&mut error),
            );

            let diagnostics = error.map(|error: ID3DBlob| {
                let bytes = std::slice::from_raw_parts(error.GetBufferPointer() as *const u8, error.GetBufferSize());
                String::from_utf8_lossy(bytes).trim_end_matches('\0').to_owned()
            });
            if let Err(e) = result {
                return Err(compile_error(diagnostics.unwrap_or_else(|| e.message())));
            }
            if let Some(warnings) = diagnostics.filter(|d| !d.trim().is_empty()) {
                warn!("{} ({}): {warnings}", source.name, source.entry_point);
            }
            blob.ok_or_else(|| compile_error("compiler returned no bytecode".to_owned()))?
        };

        let id = self.next_id();
        self.shaders.insert(id, blob);
        Ok(ShaderId(id))
    }

    fn create_binding_layout(&mut self, desc: &BindingLayoutDesc) -> Result<LayoutId, DeviceError> {
        let ranges: Vec<D3D12_DESCRIPTOR_RANGE> = desc
            .parameters
            .iter()
            .map(|parameter| D3D12_DESCRIPTOR_RANGE {
                RangeType: match parameter.kind {
                    DescriptorKind::Srv => D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
                    DescriptorKind::Cbv => D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
                    DescriptorKind::Uav => D3D12_DESCRIPTOR_RANGE_TYPE_UAV,
                },
                NumDescriptors: 1,
                BaseShaderRegister: parameter.register,
                RegisterSpace: 0,
                OffsetInDescriptorsFromTableStart: 0,
            })
            .collect();

        let parameters: Vec<D3D12_ROOT_PARAMETER> = ranges
            .iter()
            .map(|range| D3D12_ROOT_PARAMETER {
                ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
                Anonymous: D3D12_ROOT_PARAMETER_0 {
                    DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                        NumDescriptorRanges: 1,
                        pDescriptorRanges: range,
                    },
                },
                ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
            })
            .collect();

        let samplers: Vec<D3D12_STATIC_SAMPLER_DESC> = desc
            .samplers
            .iter()
            .map(|sampler| {
                let address = match sampler.address {
                    AddressMode::Wrap => D3D12_TEXTURE_ADDRESS_MODE_WRAP,
                    AddressMode::Clamp => D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
                };
                D3D12_STATIC_SAMPLER_DESC {
                    Filter: match sampler.filter {
                        SamplerFilter::Linear => D3D12_FILTER_MIN_MAG_MIP_LINEAR,
                        SamplerFilter::Point => D3D12_FILTER_MIN_MAG_MIP_POINT,
                    },
                    AddressU: address,
                    AddressV: address,
                    AddressW: address,
                    MaxLOD: D3D12_FLOAT32_MAX,
                    ShaderRegister: sampler.register,
                    RegisterSpace: 0,
                    ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
                    ..Default::default()
                }
            })
            .collect();

        let root_desc = D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: parameters.as_ptr(),
            NumStaticSamplers: samplers.len() as u32,
            pStaticSamplers: samplers.as_ptr(),
            Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
        };

        let root_signature: ID3D12RootSignature = unsafe {
            let mut signature: Option<ID3DBlob> = None;
            let mut error: Option<ID3DBlob> = None;
            if let Err(e) =
                D3D12SerializeRootSignature(&root_desc, D3D_ROOT_SIGNATURE_VERSION_1, &mut signature, Some(&mut error))
            {
                let message = error
                    .map(|error| {
                        let bytes =
                            std::slice::from_raw_parts(error.GetBufferPointer() as *const u8, error.GetBufferSize());
                        String::from_utf8_lossy(bytes).into_owned()
                    })
                    .unwrap_or_else(|| e.message());
                return Err(DeviceError::native("D3D12SerializeRootSignature", message));
            }
            let signature = signature
                .ok_or_else(|| DeviceError::native("D3D12SerializeRootSignature", "no blob returned"))?;
            self.device
                .CreateRootSignature(
                    0,
                    std::slice::from_raw_parts(signature.GetBufferPointer() as *const u8, signature.GetBufferSize()),
                )
                .map_err(native("CreateRootSignature"))?
        };

        let id = self.next_id();
        self.layouts.insert(id, root_signature);
        Ok(LayoutId(id))
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineId, DeviceError> {
        let unknown = || DeviceError::native("CreateGraphicsPipelineState", "unknown shader or layout");
        let vs_blob = self.shaders.get(&desc.vertex_shader.0).ok_or_else(unknown)?;
        let ps_blob = self.shaders.get(&desc.pixel_shader.0).ok_or_else(unknown)?;
        let root_signature = self.layouts.get(&desc.layout.0).ok_or_else(unknown)?;

        let semantics = desc
            .input_layout
            .iter()
            .map(|attribute| CString::new(attribute.semantic))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DeviceError::native("CreateGraphicsPipelineState", e.to_string()))?;
        let input_elements: Vec<D3D12_INPUT_ELEMENT_DESC> = desc
            .input_layout
            .iter()
            .zip(&semantics)
            .map(|(attribute, semantic)| D3D12_INPUT_ELEMENT_DESC {
                SemanticName: PCSTR(semantic.as_ptr() as *const u8),
                SemanticIndex: 0,
                Format: match attribute.format {
                    VertexFormat::Float32x2 => DXGI_FORMAT_R32G32_FLOAT,
                    VertexFormat::Float32x3 => DXGI_FORMAT_R32G32B32_FLOAT,
                },
                InputSlot: 0,
                AlignedByteOffset: attribute.offset,
                InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            })
            .collect();

        let mut rtv_formats = [DXGI_FORMAT_UNKNOWN; 8];
        rtv_formats[0] = DXGI_FORMAT(desc.render_target_format.dxgi() as i32);
        let mut blend = D3D12_BLEND_DESC::default();
        blend.RenderTarget[0].RenderTargetWriteMask = D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8;

        let pipeline: ID3D12PipelineState = unsafe {
            let pso_desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
                pRootSignature: borrowed(root_signature),
                VS: D3D12_SHADER_BYTECODE {
                    pShaderBytecode: vs_blob.GetBufferPointer(),
                    BytecodeLength: vs_blob.GetBufferSize(),
                },
                PS: D3D12_SHADER_BYTECODE {
                    pShaderBytecode: ps_blob.GetBufferPointer(),
                    BytecodeLength: ps_blob.GetBufferSize(),
                },
                BlendState: blend,
                SampleMask: u32::MAX,
                RasterizerState: D3D12_RASTERIZER_DESC {
                    FillMode: D3D12_FILL_MODE_SOLID,
                    CullMode: D3D12_CULL_MODE_NONE,
                    DepthClipEnable: true.into(),
                    ..Default::default()
                },
                DepthStencilState: D3D12_DEPTH_STENCIL_DESC {
                    DepthEnable: false.into(),
                    StencilEnable: false.into(),
                    ..Default::default()
                },
                InputLayout: D3D12_INPUT_LAYOUT_DESC {
                    pInputElementDescs: input_elements.as_ptr(),
                    NumElements: input_elements.len() as u32,
                },
                PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
                NumRenderTargets: 1,
                RTVFormats: rtv_formats,
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                ..Default::default()
            };
            self.device
                .CreateGraphicsPipelineState(&pso_desc)
                .map_err(native("CreateGraphicsPipelineState"))?
        };

        let id = self.next_id();
        self.pipelines.insert(id, pipeline);
        Ok(PipelineId(id))
    }

    fn completed_fence_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    fn signal_fence(&mut self, value: u64) -> Result<(), DeviceError> {
        unsafe { self.command_queue.Signal(&self.fence, value).map_err(native("Signal")) }
    }

    fn wait_for_fence(&mut self, value: u64) -> Result<(), DeviceError> {
        unsafe {
            if self.fence.GetCompletedValue() < value {
                self.fence
                    .SetEventOnCompletion(value, self.fence_event)
                    .map_err(native("SetEventOnCompletion"))?;
                WaitForSingleObject(self.fence_event, INFINITE);
            }
        }
        Ok(())
    }

    fn current_back_buffer(&self) -> usize {
        unsafe { self.swapchain.GetCurrentBackBufferIndex() as usize }
    }

    fn reset_commands(&mut self, allocator: usize) -> Result<(), DeviceError> {
        unsafe {
            let allocator = &self.command_allocators[allocator];
            allocator.Reset().map_err(native("ID3D12CommandAllocator::Reset"))?;
            self.command_list
                .Reset(allocator, None)
                .map_err(native("ID3D12GraphicsCommandList::Reset"))
        }
    }

    fn transition_back_buffer(&mut self, index: usize, before: ResourceState, after: ResourceState) {
        unsafe {
            resource_barrier(&self.command_list, &self.render_targets[index], before.into(), after.into());
        }
    }

    fn transition_resource(&mut self, resource: ResourceId, before: ResourceState, after: ResourceState) {
        if let Some(target) = self.resource(resource) {
            unsafe {
                resource_barrier(&self.command_list, target, before.into(), after.into());
            }
        }
    }

    fn set_render_target(&mut self, back_buffer: usize) {
        let rtv_handle = self.rtv_handle(back_buffer);
        unsafe {
            self.command_list.OMSetRenderTargets(1, Some(&rtv_handle), false, None);
        }
    }

    fn clear_render_target(&mut self, back_buffer: usize, color: [f32; 4]) {
        let rtv_handle = self.rtv_handle(back_buffer);
        unsafe {
            self.command_list.ClearRenderTargetView(rtv_handle, &color, None);
        }
    }

    fn bind_descriptor_heap(&mut self) {
        unsafe {
            self.command_list.SetDescriptorHeaps(&[Some(self.srv_heap.clone())]);
        }
    }

    fn copy_buffer(&mut self, dst: ResourceId, src: ResourceId, size: u64) {
        let (Some(dst), Some(src)) = (self.resource(dst), self.resource(src)) else {
            return;
        };
        unsafe {
            self.command_list.CopyBufferRegion(dst, 0, src, 0, size);
        }
    }

    fn copy_texture_region(
        &mut self,
        dst: ResourceId,
        subresource: u32,
        src: ResourceId,
        footprint: &SubresourceFootprint,
        format: TextureFormat,
    ) {
        let (Some(dst), Some(src)) = (self.resource(dst), self.resource(src)) else {
            return;
        };
        unsafe {
            let dst = D3D12_TEXTURE_COPY_LOCATION {
                pResource: borrowed(dst),
                Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                    SubresourceIndex: subresource,
                },
            };
            let src = D3D12_TEXTURE_COPY_LOCATION {
                pResource: borrowed(src),
                Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                    PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                        Offset: footprint.offset,
                        Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                            Format: DXGI_FORMAT(format.dxgi() as i32),
                            Width: footprint.width,
                            Height: footprint.height,
                            Depth: 1,
                            RowPitch: footprint.row_pitch,
                        },
                    },
                },
            };
            self.command_list.CopyTextureRegion(&dst, 0, 0, 0, &src, None);
        }
    }

    fn set_pipeline(&mut self, pipeline: PipelineId) {
        match self.pipelines.get(&pipeline.0) {
            Some(pso) => unsafe { self.command_list.SetPipelineState(pso) },
            None => warn!("dx12: unknown pipeline {pipeline:?}"),
        }
    }

    fn set_binding_layout(&mut self, layout: LayoutId) {
        match self.layouts.get(&layout.0) {
            Some(root_signature) => unsafe { self.command_list.SetGraphicsRootSignature(root_signature) },
            None => warn!("dx12: unknown layout {layout:?}"),
        }
    }

    fn set_descriptor_table(&mut self, parameter: u32, handle: GpuDescriptorHandle) {
        unsafe {
            self.command_list
                .SetGraphicsRootDescriptorTable(parameter, D3D12_GPU_DESCRIPTOR_HANDLE { ptr: handle.0 });
        }
    }

    fn set_geometry(&mut self, geometry: &GeometryBinding) {
        let (Some(vertices), Some(indices)) =
            (self.resource(geometry.vertex_buffer), self.resource(geometry.index_buffer))
        else {
            return;
        };
        unsafe {
            let vertex_view = D3D12_VERTEX_BUFFER_VIEW {
                BufferLocation: vertices.GetGPUVirtualAddress(),
                SizeInBytes: geometry.vertex_bytes,
                StrideInBytes: geometry.vertex_stride,
            };
            let index_view = D3D12_INDEX_BUFFER_VIEW {
                BufferLocation: indices.GetGPUVirtualAddress(),
                SizeInBytes: geometry.index_bytes,
                Format: DXGI_FORMAT_R16_UINT,
            };
            self.command_list.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            self.command_list.IASetVertexBuffers(0, Some(&[vertex_view]));
            self.command_list.IASetIndexBuffer(Some(&index_view));
        }
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        unsafe {
            self.command_list.RSSetViewports(&[D3D12_VIEWPORT {
                Width: width as f32,
                Height: height as f32,
                MaxDepth: 1.0,
                ..Default::default()
            }]);
            self.command_list.RSSetScissorRects(&[RECT {
                right: width as i32,
                bottom: height as i32,
                ..Default::default()
            }]);
        }
    }

    fn draw_indexed(&mut self, index_count: u32) {
        unsafe {
            self.command_list.DrawIndexedInstanced(index_count, 1, 0, 0, 0);
        }
    }

    fn execute(&mut self) -> Result<(), DeviceError> {
        unsafe {
            self.command_list.Close().map_err(native("Close"))?;
            let command_lists = [Some(
                self.command_list
                    .cast::<ID3D12CommandList>()
                    .map_err(native("ID3D12CommandList"))?,
            )];
            self.command_queue.ExecuteCommandLists(&command_lists);
        }
        Ok(())
    }

    fn present(&mut self, sync_interval: u32) -> Result<PresentStatus, DeviceError> {
        let hr = unsafe { self.swapchain.Present(sync_interval, DXGI_PRESENT(0)) };
        if hr == DXGI_ERROR_DEVICE_REMOVED || hr == DXGI_ERROR_DEVICE_RESET {
            let reason = match unsafe { self.device.GetDeviceRemovedReason() } {
                Err(e) => e.message(),
                Ok(()) => windows::core::Error::from(hr).message(),
            };
            return Err(DeviceError::DeviceLost { reason });
        }
        if hr == DXGI_STATUS_OCCLUDED {
            return Ok(PresentStatus::Occluded);
        }
        hr.ok().map_err(native("Present"))?;
        Ok(PresentStatus::Presented)
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> Result<(), DeviceError> {
        unsafe {
            // Allocators may still reference the old back buffers.
            for allocator in &self.command_allocators {
                allocator.Reset().map_err(native("ID3D12CommandAllocator::Reset"))?;
            }

            self.render_targets.clear();
            self.swapchain
                .ResizeBuffers(FRAME_COUNT as u32, width, height, BACK_BUFFER_FORMAT, DXGI_SWAP_CHAIN_FLAG(0))
                .map_err(native("ResizeBuffers"))?;
            self.render_targets =
                create_render_targets(&self.device, &self.swapchain, &self.rtv_heap, self.rtv_descriptor_size)?;
        }
        info!("swapchain resized to {width}x{height}");
        Ok(())
    }
}

impl Drop for Dx12Backend {
    fn drop(&mut self) {
        unsafe {
            let value = self.fence.GetCompletedValue() + 1;
            if self.command_queue.Signal(&self.fence, value).is_ok() {
                let _ = self.wait_for_fence(value);
            }
            if !self.fence_event.is_invalid() {
                let _ = CloseHandle(self.fence_event);
            }
        }
    }
}

impl From<ResourceState> for D3D12_RESOURCE_STATES {
    fn from(state: ResourceState) -> Self {
        match state {
            ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
            ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
            ResourceState::PixelShaderResource => D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
            ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
            ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
        }
    }
}

unsafe fn create_render_targets(
    device: &ID3D12Device,
    swapchain: &IDXGISwapChain4,
    rtv_heap: &ID3D12DescriptorHeap,
    rtv_descriptor_size: u32,
) -> Result<Vec<ID3D12Resource>, DeviceError> {
    unsafe {
        let mut render_targets = Vec::with_capacity(FRAME_COUNT);
        let rtv_start = rtv_heap.GetCPUDescriptorHandleForHeapStart();
        for i in 0..FRAME_COUNT as u32 {
            let resource: ID3D12Resource = swapchain.GetBuffer(i).map_err(native("GetBuffer"))?;
            let handle = D3D12_CPU_DESCRIPTOR_HANDLE {
                ptr: rtv_start.ptr + (i * rtv_descriptor_size) as usize,
            };
            device.CreateRenderTargetView(&resource, None, handle);
            render_targets.push(resource);
        }
        Ok(render_targets)
    }
}

unsafe fn get_hardware_adapter(factory: &IDXGIFactory4) -> Result<IDXGIAdapter1, DeviceError> {
    unsafe {
        for i in 0.. {
            let adapter = match factory.EnumAdapters1(i) {
                Ok(a) => a,
                Err(_) => break,
            };

            let desc = adapter.GetDesc1().map_err(native("GetDesc1"))?;

            if (desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32) != 0 {
                continue;
            }

            if D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, std::ptr::null_mut::<Option<ID3D12Device>>()).is_ok()
            {
                let name = String::from_utf16_lossy(&desc.Description);
                info!("using adapter {}", name.trim_end_matches('\0'));
                return Ok(adapter);
            }
        }
        Err(DeviceError::native("EnumAdapters1", "no hardware adapter supports D3D12"))
    }
}

/// Non-owning copy of an interface pointer for descriptor structs that hold
/// `ManuallyDrop<Option<T>>`. Leaves the reference count untouched.
unsafe fn borrowed<T: Interface>(interface: &T) -> ManuallyDrop<Option<T>> {
    unsafe { std::mem::transmute_copy(interface) }
}

unsafe fn resource_barrier(
    command_list: &ID3D12GraphicsCommandList,
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) {
    unsafe {
        let barriers = [D3D12_RESOURCE_BARRIER {
            Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
            Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                    pResource: borrowed(resource),
                    StateBefore: before,
                    StateAfter: after,
                    Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                }),
            },
        }];
        command_list.ResourceBarrier(&barriers);
    }
}
