use log::{debug, info, warn};
use thiserror::Error;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL;
use windows::Win32::Graphics::Direct3D12::{
    D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_COMMAND_QUEUE_DESC, D3D12_CPU_DESCRIPTOR_HANDLE,
    D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING, D3D12_DESCRIPTOR_HEAP_DESC,
    D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE, D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
    D3D12_DESCRIPTOR_HEAP_TYPE_RTV, D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER, D3D12_FILTER_MIN_MAG_MIP_LINEAR,
    D3D12_HEAP_FLAG_NONE, D3D12_HEAP_PROPERTIES, D3D12_HEAP_TYPE_DEFAULT, D3D12_HEAP_TYPE_UPLOAD,
    D3D12_RESOURCE_DESC, D3D12_RESOURCE_DIMENSION_BUFFER, D3D12_RESOURCE_DIMENSION_TEXTURE2D,
    D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS, D3D12_RESOURCE_FLAG_NONE,
    D3D12_RESOURCE_STATE_GENERIC_READ, D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
    D3D12_RESOURCE_STATES, D3D12_SAMPLER_DESC, D3D12_SHADER_RESOURCE_VIEW_DESC,
    D3D12_SHADER_RESOURCE_VIEW_DESC_0, D3D12_SRV_DIMENSION_TEXTURE2D, D3D12_TEX2D_SRV,
    D3D12_TEXTURE_ADDRESS_MODE_CLAMP, D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
    D3D12_UAV_DIMENSION_TEXTURE2D, D3D12_UNORDERED_ACCESS_VIEW_DESC,
    D3D12_UNORDERED_ACCESS_VIEW_DESC_0, D3D12_VERTEX_BUFFER_VIEW, D3D12CreateDevice,
    ID3D12CommandAllocator, ID3D12CommandQueue, ID3D12DescriptorHeap, ID3D12Device,
    ID3D12GraphicsCommandList, ID3D12PipelineState, ID3D12Resource, ID3D12RootSignature,
    D3D12_TEX2D_UAV,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_FORMAT_R32_FLOAT, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    DXGI_SWAP_CHAIN_DESC1, DXGI_SWAP_EFFECT_FLIP_DISCARD, DXGI_USAGE_RENDER_TARGET_OUTPUT,
    IDXGIAdapter1, IDXGIFactory6, IDXGISwapChain1, IDXGISwapChain3,
};
use windows_core::{Error as WinError, IUnknown, Interface};

use crate::config::EffectsConfig;
use crate::gfx::adapter::FEATURE_TIERS;
use crate::gfx::pipeline::{
    PipelineError, ShaderSet, create_compute_pipeline, create_compute_root_signature,
    create_graphics_pipeline, create_graphics_root_signature,
};
use crate::gfx::sync::FrameSync;
use crate::gfx::{align_constant_buffer_size, cpu_descriptor};

/// Back-buffer format shared by the swap chain, pipeline, and capture texture.
pub const TARGET_FORMAT: DXGI_FORMAT = DXGI_FORMAT_R8G8B8A8_UNORM;

/// SRV/UAV heap layout: the capture texture the pixel shader samples, the fog
/// texture the compute pass reads, and the fog texture's writable view.
pub const SCREEN_SRV_INDEX: u32 = 0;
pub const FOG_SRV_INDEX: u32 = 1;
pub const FOG_UAV_INDEX: u32 = 2;
const SRV_HEAP_SLOTS: u32 = 3;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no device could be created at any candidate feature tier")]
    NoFeatureTier,

    #[error("failed to create command queue: {0}")]
    CommandQueue(WinError),

    #[error("failed to create presentation chain: {0}")]
    SwapChain(WinError),

    #[error("failed to create descriptor heap: {0}")]
    DescriptorHeap(WinError),

    #[error("failed to retrieve back buffer {index}: {source}")]
    BackBuffer { index: u32, source: WinError },

    #[error("failed to create command allocator: {0}")]
    CommandAllocator(WinError),

    #[error("failed to create command list: {0}")]
    CommandList(WinError),

    #[error("failed to create fence: {0}")]
    Fence(WinError),

    #[error("failed to create {what}: {source}")]
    Resource {
        what: &'static str,
        source: WinError,
    },

    #[error("failed to map {what}: {source}")]
    Map {
        what: &'static str,
        source: WinError,
    },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Feature flags for the one unified frame pipeline.
///
/// `buffer_count` selects the presentation-chain depth; `post_process` gates the
/// fog compute pre-pass (which additionally requires its kernel to have
/// compiled).
#[derive(Clone, Copy, Debug)]
pub struct PipelineOptions {
    pub buffer_count: u32,
    pub post_process: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            buffer_count: 3,
            post_process: true,
        }
    }
}

/// Per-back-buffer resources, indexed by the presentation chain's currently
/// assigned buffer index (platform-assigned, not round-robin).
pub struct FrameSlot {
    pub allocator: ID3D12CommandAllocator,
    pub render_target: ID3D12Resource,
    pub constant_buffer: ID3D12Resource,
    mapped: *mut u8,
}

impl FrameSlot {
    /// Copies the full 128-byte configuration into this slot's persistently
    /// mapped constant-buffer region. Safe to call only after the fence wait
    /// for this slot's previous submission has returned.
    pub fn write_constants(&self, config: &EffectsConfig) {
        let bytes = bytemuck::bytes_of(config);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.mapped, bytes.len()) };
    }
}

pub struct GraphicsPipeline {
    pub root_signature: ID3D12RootSignature,
    pub state: ID3D12PipelineState,
}

pub struct ComputePipeline {
    pub root_signature: ID3D12RootSignature,
    pub state: ID3D12PipelineState,
}

/// Everything device-dependent, owned exclusively by the render thread.
///
/// Torn down and rebuilt wholesale on recovery; the DXGI factory, the chosen
/// adapter, and the window survive outside this struct.
pub struct DeviceContext {
    pub device: ID3D12Device,
    pub queue: ID3D12CommandQueue,
    pub swapchain: IDXGISwapChain3,
    pub rtv_heap: ID3D12DescriptorHeap,
    pub rtv_increment: u32,
    pub srv_heap: ID3D12DescriptorHeap,
    pub srv_increment: u32,
    pub sampler_heap: ID3D12DescriptorHeap,
    pub command_list: ID3D12GraphicsCommandList,
    pub slots: Vec<FrameSlot>,
    pub sync: FrameSync,
    pub screen_texture: ID3D12Resource,
    pub fog_texture: Option<ID3D12Resource>,
    /// Keeps the quad buffer alive; `vertex_view` points into it.
    _vertex_buffer: ID3D12Resource,
    pub vertex_view: D3D12_VERTEX_BUFFER_VIEW,
    pub graphics: GraphicsPipeline,
    pub compute: Option<ComputePipeline>,
    pub width: u32,
    pub height: u32,
}

impl DeviceContext {
    /// Builds the device and every persistent GPU resource, in dependency
    /// order. Any core step failing aborts creation; everything built so far is
    /// released on unwind. A failed compute pipeline only disables the
    /// post-process pass.
    pub fn create(
        factory: &IDXGIFactory6,
        adapter: Option<&IDXGIAdapter1>,
        hwnd: HWND,
        width: u32,
        height: u32,
        shaders: &ShaderSet,
        initial_config: &EffectsConfig,
        options: PipelineOptions,
    ) -> Result<Self, DeviceError> {
        let (device, feature_tier) = create_device(adapter)?;

        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                ..Default::default()
            })
        }
        .map_err(DeviceError::CommandQueue)?;

        let swapchain = create_swapchain(factory, &queue, hwnd, width, height, options.buffer_count)?;

        let rtv_heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
                NumDescriptors: options.buffer_count,
                ..Default::default()
            })
        }
        .map_err(DeviceError::DescriptorHeap)?;
        let rtv_increment =
            unsafe { device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_RTV) };

        let srv_heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                NumDescriptors: SRV_HEAP_SLOTS,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
                ..Default::default()
            })
        }
        .map_err(DeviceError::DescriptorHeap)?;
        let srv_increment = unsafe {
            device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV)
        };

        let sampler_heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
                NumDescriptors: 1,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
                ..Default::default()
            })
        }
        .map_err(DeviceError::DescriptorHeap)?;

        // Per-slot allocators, render targets, and persistently mapped constant
        // buffers.
        let cb_size = align_constant_buffer_size(EffectsConfig::SIZE as u64);
        let mut slots = Vec::with_capacity(options.buffer_count as usize);
        for index in 0..options.buffer_count {
            let render_target: ID3D12Resource = unsafe { swapchain.GetBuffer(index) }
                .map_err(|source| DeviceError::BackBuffer { index, source })?;
            unsafe {
                device.CreateRenderTargetView(
                    &render_target,
                    None,
                    cpu_descriptor(&rtv_heap, index, rtv_increment),
                )
            };

            let allocator: ID3D12CommandAllocator = unsafe {
                device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)
            }
            .map_err(DeviceError::CommandAllocator)?;

            let constant_buffer =
                committed_buffer(&device, D3D12_HEAP_TYPE_UPLOAD, cb_size, "constant buffer")?;
            let mut mapped: *mut std::ffi::c_void = std::ptr::null_mut();
            unsafe { constant_buffer.Map(0, None, Some(&mut mapped)) }.map_err(|source| {
                DeviceError::Map {
                    what: "constant buffer",
                    source,
                }
            })?;
            let slot = FrameSlot {
                allocator,
                render_target,
                constant_buffer,
                mapped: mapped as *mut u8,
            };
            // Upload heaps stay mapped for the slot's lifetime; seed each one
            // with the current configuration.
            slot.write_constants(initial_config);
            slots.push(slot);
        }

        let command_list: ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &slots[0].allocator, None)
        }
        .map_err(DeviceError::CommandList)?;
        unsafe { command_list.Close() }.map_err(DeviceError::CommandList)?;

        let sync = FrameSync::new(&device).map_err(DeviceError::Fence)?;

        // The capture destination lives in the shader-readable state between
        // ticks; the capture pipeline transitions it around each upload.
        let screen_texture = committed_texture(
            &device,
            TARGET_FORMAT,
            width,
            height,
            D3D12_RESOURCE_FLAG_NONE,
            D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
            "capture texture",
        )?;
        unsafe {
            device.CreateShaderResourceView(
                &screen_texture,
                Some(&texture_srv_desc(TARGET_FORMAT)),
                cpu_descriptor(&srv_heap, SCREEN_SRV_INDEX, srv_increment),
            )
        };

        let compute_wanted = options.post_process && shaders.fog_compute.is_some();
        let fog_texture = if compute_wanted {
            let texture = committed_texture(
                &device,
                DXGI_FORMAT_R32_FLOAT,
                width,
                height,
                D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS,
                D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
                "fog texture",
            )?;
            unsafe {
                device.CreateShaderResourceView(
                    &texture,
                    Some(&texture_srv_desc(DXGI_FORMAT_R32_FLOAT)),
                    cpu_descriptor(&srv_heap, FOG_SRV_INDEX, srv_increment),
                );
                device.CreateUnorderedAccessView(
                    &texture,
                    None,
                    Some(&D3D12_UNORDERED_ACCESS_VIEW_DESC {
                        Format: DXGI_FORMAT_R32_FLOAT,
                        ViewDimension: D3D12_UAV_DIMENSION_TEXTURE2D,
                        Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_UAV::default(),
                        },
                    }),
                    cpu_descriptor(&srv_heap, FOG_UAV_INDEX, srv_increment),
                );
            }
            Some(texture)
        } else {
            None
        };

        unsafe {
            device.CreateSampler(
                &D3D12_SAMPLER_DESC {
                    Filter: D3D12_FILTER_MIN_MAG_MIP_LINEAR,
                    AddressU: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
                    AddressV: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
                    AddressW: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
                    ..Default::default()
                },
                cpu_descriptor(&sampler_heap, 0, 0),
            )
        };

        let (vertex_buffer, vertex_view) = create_quad_vertex_buffer(&device)?;

        let graphics_root = create_graphics_root_signature(&device)?;
        let graphics_state = create_graphics_pipeline(&device, &graphics_root, shaders, TARGET_FORMAT)?;
        let graphics = GraphicsPipeline {
            root_signature: graphics_root,
            state: graphics_state,
        };

        // A compute pipeline that fails to build disables only the post-process
        // pass, mirroring the missing-kernel case.
        let compute = if let (true, Some(kernel)) = (compute_wanted, shaders.fog_compute.as_ref()) {
            match create_compute_root_signature(&device)
                .and_then(|root| {
                    create_compute_pipeline(&device, &root, kernel).map(|state| ComputePipeline {
                        root_signature: root,
                        state,
                    })
                }) {
                Ok(pipeline) => Some(pipeline),
                Err(e) => {
                    warn!("compute pipeline unavailable, post-process pass disabled: {e}");
                    None
                }
            }
        } else {
            None
        };

        info!(
            "device and resources created ({}x{}, {} back buffers, tier {:#x}, post-process {})",
            width,
            height,
            options.buffer_count,
            feature_tier.0,
            compute.is_some(),
        );

        Ok(Self {
            device,
            queue,
            swapchain,
            rtv_heap,
            rtv_increment,
            srv_heap,
            srv_increment,
            sampler_heap,
            command_list,
            slots,
            sync,
            screen_texture,
            fog_texture,
            _vertex_buffer: vertex_buffer,
            vertex_view,
            graphics,
            compute,
            width,
            height,
        })
    }

    pub fn current_back_buffer_index(&self) -> u32 {
        unsafe { self.swapchain.GetCurrentBackBufferIndex() }
    }

    pub fn rtv_handle(&self, index: u32) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        cpu_descriptor(&self.rtv_heap, index, self.rtv_increment)
    }

    /// Blocks until the GPU has drained all submitted work.
    pub fn wait_for_gpu(&mut self) -> Result<(), WinError> {
        self.sync.wait_idle(&self.queue)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // Let in-flight work drain before the resources underneath it go away.
        if let Err(e) = self.sync.wait_idle(&self.queue) {
            warn!("GPU idle wait during teardown failed: {e}");
        }
        for slot in &self.slots {
            unsafe { slot.constant_buffer.Unmap(0, None) };
        }
        debug!("device context released");
    }
}

fn create_device(
    adapter: Option<&IDXGIAdapter1>,
) -> Result<(ID3D12Device, D3D_FEATURE_LEVEL), DeviceError> {
    let adapter: Option<&IUnknown> = adapter.map(|a| a.into());
    for &tier in &FEATURE_TIERS {
        let mut device: Option<ID3D12Device> = None;
        if unsafe { D3D12CreateDevice(adapter, tier, &mut device) }.is_ok()
            && let Some(device) = device
        {
            debug!("created device at feature tier {:#x}", tier.0);
            return Ok((device, tier));
        }
    }
    Err(DeviceError::NoFeatureTier)
}

fn create_swapchain(
    factory: &IDXGIFactory6,
    queue: &ID3D12CommandQueue,
    hwnd: HWND,
    width: u32,
    height: u32,
    buffer_count: u32,
) -> Result<IDXGISwapChain3, DeviceError> {
    let desc = DXGI_SWAP_CHAIN_DESC1 {
        Width: width,
        Height: height,
        Format: TARGET_FORMAT,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
        BufferCount: buffer_count,
        SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
        ..Default::default()
    };
    let swapchain: IDXGISwapChain1 =
        unsafe { factory.CreateSwapChainForHwnd(queue, hwnd, &desc, None, None) }
            .map_err(DeviceError::SwapChain)?;
    swapchain.cast().map_err(DeviceError::SwapChain)
}

/// Upload-heap buffer in the generic-read state, shared with the capture
/// bridge for its GPU-visible upload surface.
pub(crate) fn committed_upload_buffer(
    device: &ID3D12Device,
    size: u64,
    what: &'static str,
) -> Result<ID3D12Resource, DeviceError> {
    committed_buffer(device, D3D12_HEAP_TYPE_UPLOAD, size, what)
}

fn committed_buffer(
    device: &ID3D12Device,
    heap_type: windows::Win32::Graphics::Direct3D12::D3D12_HEAP_TYPE,
    size: u64,
    what: &'static str,
) -> Result<ID3D12Resource, DeviceError> {
    let mut resource: Option<ID3D12Resource> = None;
    unsafe {
        device.CreateCommittedResource(
            &D3D12_HEAP_PROPERTIES {
                Type: heap_type,
                ..Default::default()
            },
            D3D12_HEAP_FLAG_NONE,
            &D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                Width: size,
                Height: 1,
                DepthOrArraySize: 1,
                MipLevels: 1,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                ..Default::default()
            },
            D3D12_RESOURCE_STATE_GENERIC_READ,
            None,
            &mut resource,
        )
    }
    .map_err(|source| DeviceError::Resource { what, source })?;
    resource.ok_or(DeviceError::Resource {
        what,
        source: WinError::empty(),
    })
}

#[allow(clippy::too_many_arguments)]
fn committed_texture(
    device: &ID3D12Device,
    format: DXGI_FORMAT,
    width: u32,
    height: u32,
    flags: windows::Win32::Graphics::Direct3D12::D3D12_RESOURCE_FLAGS,
    initial_state: D3D12_RESOURCE_STATES,
    what: &'static str,
) -> Result<ID3D12Resource, DeviceError> {
    let mut resource: Option<ID3D12Resource> = None;
    unsafe {
        device.CreateCommittedResource(
            &D3D12_HEAP_PROPERTIES {
                Type: D3D12_HEAP_TYPE_DEFAULT,
                ..Default::default()
            },
            D3D12_HEAP_FLAG_NONE,
            &D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
                Width: width as u64,
                Height: height,
                DepthOrArraySize: 1,
                MipLevels: 1,
                Format: format,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Flags: flags,
                ..Default::default()
            },
            initial_state,
            None,
            &mut resource,
        )
    }
    .map_err(|source| DeviceError::Resource { what, source })?;
    resource.ok_or(DeviceError::Resource {
        what,
        source: WinError::empty(),
    })
}

fn texture_srv_desc(format: DXGI_FORMAT) -> D3D12_SHADER_RESOURCE_VIEW_DESC {
    D3D12_SHADER_RESOURCE_VIEW_DESC {
        Format: format,
        ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
        Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
        Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
            Texture2D: D3D12_TEX2D_SRV {
                MipLevels: 1,
                ..Default::default()
            },
        },
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct QuadVertex {
    position: [f32; 3],
    uv: [f32; 2],
}

/// Static full-screen quad, drawn as a 4-vertex triangle strip.
fn create_quad_vertex_buffer(
    device: &ID3D12Device,
) -> Result<(ID3D12Resource, D3D12_VERTEX_BUFFER_VIEW), DeviceError> {
    const QUAD: [QuadVertex; 4] = [
        QuadVertex {
            position: [-1.0, 1.0, 0.0],
            uv: [0.0, 0.0],
        },
        QuadVertex {
            position: [1.0, 1.0, 0.0],
            uv: [1.0, 0.0],
        },
        QuadVertex {
            position: [-1.0, -1.0, 0.0],
            uv: [0.0, 1.0],
        },
        QuadVertex {
            position: [1.0, -1.0, 0.0],
            uv: [1.0, 1.0],
        },
    ];

    let bytes = bytemuck::bytes_of(&QUAD);
    let buffer = committed_buffer(
        device,
        D3D12_HEAP_TYPE_UPLOAD,
        bytes.len() as u64,
        "vertex buffer",
    )?;

    let mut mapped: *mut std::ffi::c_void = std::ptr::null_mut();
    unsafe { buffer.Map(0, None, Some(&mut mapped)) }.map_err(|source| DeviceError::Map {
        what: "vertex buffer",
        source,
    })?;
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped as *mut u8, bytes.len());
        buffer.Unmap(0, None);
    }

    let view = D3D12_VERTEX_BUFFER_VIEW {
        BufferLocation: unsafe { buffer.GetGPUVirtualAddress() },
        SizeInBytes: bytes.len() as u32,
        StrideInBytes: size_of::<QuadVertex>() as u32,
    };
    Ok((buffer, view))
}
