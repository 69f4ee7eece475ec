use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;
use windows::Win32::Graphics::Direct3D::Fxc::{D3DCOMPILE_OPTIMIZATION_LEVEL3, D3DCompile};
use windows::Win32::Graphics::Direct3D::ID3DBlob;
use windows::Win32::Graphics::Direct3D12::{
    D3D12_BLEND_DESC, D3D12_COMPUTE_PIPELINE_STATE_DESC, D3D12_CULL_MODE_NONE,
    D3D12_DESCRIPTOR_RANGE, D3D12_DESCRIPTOR_RANGE_TYPE_SAMPLER, D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
    D3D12_DESCRIPTOR_RANGE_TYPE_UAV, D3D12_FILL_MODE_SOLID, D3D12_GRAPHICS_PIPELINE_STATE_DESC,
    D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA, D3D12_INPUT_ELEMENT_DESC, D3D12_INPUT_LAYOUT_DESC,
    D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE, D3D12_RASTERIZER_DESC,
    D3D12_ROOT_DESCRIPTOR, D3D12_ROOT_DESCRIPTOR_TABLE, D3D12_ROOT_PARAMETER,
    D3D12_ROOT_PARAMETER_0, D3D12_ROOT_PARAMETER_TYPE_CBV,
    D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE, D3D12_ROOT_SIGNATURE_DESC,
    D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT, D3D12_ROOT_SIGNATURE_FLAG_NONE,
    D3D12_SHADER_BYTECODE, D3D12_SHADER_VISIBILITY_ALL, D3D12_SHADER_VISIBILITY_PIXEL,
    D3D12SerializeRootSignature, D3D_ROOT_SIGNATURE_VERSION_1, ID3D12Device, ID3D12PipelineState,
    ID3D12RootSignature,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_R32G32_FLOAT, DXGI_FORMAT_R32G32B32_FLOAT, DXGI_SAMPLE_DESC,
};
use windows::core::PCSTR;
use windows_core::Error as WinError;

/// Overrides the directory the HLSL kernels are loaded from.
pub const SHADER_DIR_ENV: &str = "HOLODESK_SHADER_DIR";

const VERTEX_KERNEL: KernelSpec = KernelSpec {
    file: "overlay_vs.hlsl",
    entry: "VSMain",
    target: "vs_5_0",
};
const PIXEL_KERNEL: KernelSpec = KernelSpec {
    file: "overlay_ps.hlsl",
    entry: "PSMain",
    target: "ps_5_0",
};
const FOG_KERNEL: KernelSpec = KernelSpec {
    file: "fog_cs.hlsl",
    entry: "CSMain",
    target: "cs_5_0",
};

struct KernelSpec {
    file: &'static str,
    entry: &'static str,
    target: &'static str,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("shader kernel {} could not be read: {source}", path.display())]
    ShaderMissing {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("shader kernel {file} failed to compile: {message}")]
    ShaderCompile { file: &'static str, message: String },

    #[error("root signature serialization failed: {0}")]
    RootSignature(WinError),

    #[error("pipeline state creation failed: {0}")]
    PipelineState(WinError),
}

/// Compiled kernel bytecode for the frame pipeline.
///
/// The vertex/pixel pair is mandatory; a missing or uncompilable fog compute
/// kernel disables only the post-process pass.
pub struct ShaderSet {
    pub vertex: ID3DBlob,
    pub pixel: ID3DBlob,
    pub fog_compute: Option<ID3DBlob>,
}

impl ShaderSet {
    pub fn load() -> Result<Self, PipelineError> {
        Self::load_from(&shader_dir())
    }

    pub fn load_from(dir: &Path) -> Result<Self, PipelineError> {
        let vertex = compile_kernel(dir, &VERTEX_KERNEL)?;
        let pixel = compile_kernel(dir, &PIXEL_KERNEL)?;
        let fog_compute = match compile_kernel(dir, &FOG_KERNEL) {
            Ok(blob) => Some(blob),
            Err(e) => {
                warn!("fog compute kernel unavailable, post-process pass disabled: {e}");
                None
            }
        };
        info!("shader kernels loaded from {}", dir.display());
        Ok(Self {
            vertex,
            pixel,
            fog_compute,
        })
    }
}

fn shader_dir() -> PathBuf {
    std::env::var_os(SHADER_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("shaders"))
}

fn compile_kernel(dir: &Path, kernel: &KernelSpec) -> Result<ID3DBlob, PipelineError> {
    let path = dir.join(kernel.file);
    let source = std::fs::read(&path).map_err(|source| PipelineError::ShaderMissing {
        path: path.clone(),
        source,
    })?;

    let entry = CString::new(kernel.entry).expect("static entry point");
    let target = CString::new(kernel.target).expect("static target profile");
    let mut blob: Option<ID3DBlob> = None;
    let mut errors: Option<ID3DBlob> = None;

    let result = unsafe {
        D3DCompile(
            source.as_ptr() as *const std::ffi::c_void,
            source.len(),
            None,
            None,
            None,
            PCSTR(entry.as_ptr() as *const u8),
            PCSTR(target.as_ptr() as *const u8),
            D3DCOMPILE_OPTIMIZATION_LEVEL3,
            0,
            &mut blob,
            Some(&mut errors),
        )
    };

    if let Err(e) = result {
        let message = errors
            .map(|blob| blob_to_string(&blob))
            .unwrap_or_else(|| e.to_string());
        return Err(PipelineError::ShaderCompile {
            file: kernel.file,
            message,
        });
    }

    blob.ok_or(PipelineError::ShaderCompile {
        file: kernel.file,
        message: "compiler produced no bytecode".into(),
    })
}

fn blob_to_string(blob: &ID3DBlob) -> String {
    let bytes = unsafe {
        std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
    };
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

fn bytecode(blob: &ID3DBlob) -> D3D12_SHADER_BYTECODE {
    D3D12_SHADER_BYTECODE {
        pShaderBytecode: unsafe { blob.GetBufferPointer() },
        BytecodeLength: unsafe { blob.GetBufferSize() },
    }
}

/// Graphics binding contract: texture at slot 0, sampler at slot 0, constant
/// buffer bound last.
pub fn create_graphics_root_signature(
    device: &ID3D12Device,
) -> Result<ID3D12RootSignature, PipelineError> {
    let srv_range = D3D12_DESCRIPTOR_RANGE {
        RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
        NumDescriptors: 1,
        BaseShaderRegister: 0,
        RegisterSpace: 0,
        OffsetInDescriptorsFromTableStart: 0,
    };
    let sampler_range = D3D12_DESCRIPTOR_RANGE {
        RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_SAMPLER,
        NumDescriptors: 1,
        BaseShaderRegister: 0,
        RegisterSpace: 0,
        OffsetInDescriptorsFromTableStart: 0,
    };

    let parameters = [
        descriptor_table_parameter(&srv_range, D3D12_SHADER_VISIBILITY_PIXEL),
        descriptor_table_parameter(&sampler_range, D3D12_SHADER_VISIBILITY_PIXEL),
        constant_buffer_parameter(),
    ];

    serialize_root_signature(
        device,
        &D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: parameters.as_ptr(),
            Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
            ..Default::default()
        },
    )
}

/// Compute binding contract: two input textures, one output texture, constant
/// buffer last.
pub fn create_compute_root_signature(
    device: &ID3D12Device,
) -> Result<ID3D12RootSignature, PipelineError> {
    let srv_range = D3D12_DESCRIPTOR_RANGE {
        RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
        NumDescriptors: 2,
        BaseShaderRegister: 0,
        RegisterSpace: 0,
        OffsetInDescriptorsFromTableStart: 0,
    };
    let uav_range = D3D12_DESCRIPTOR_RANGE {
        RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_UAV,
        NumDescriptors: 1,
        BaseShaderRegister: 0,
        RegisterSpace: 0,
        OffsetInDescriptorsFromTableStart: 0,
    };

    let parameters = [
        descriptor_table_parameter(&srv_range, D3D12_SHADER_VISIBILITY_ALL),
        descriptor_table_parameter(&uav_range, D3D12_SHADER_VISIBILITY_ALL),
        constant_buffer_parameter(),
    ];

    serialize_root_signature(
        device,
        &D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: parameters.as_ptr(),
            Flags: D3D12_ROOT_SIGNATURE_FLAG_NONE,
            ..Default::default()
        },
    )
}

fn descriptor_table_parameter(
    range: &D3D12_DESCRIPTOR_RANGE,
    visibility: windows::Win32::Graphics::Direct3D12::D3D12_SHADER_VISIBILITY,
) -> D3D12_ROOT_PARAMETER {
    D3D12_ROOT_PARAMETER {
        ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
        Anonymous: D3D12_ROOT_PARAMETER_0 {
            DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                NumDescriptorRanges: 1,
                pDescriptorRanges: range,
            },
        },
        ShaderVisibility: visibility,
    }
}

fn constant_buffer_parameter() -> D3D12_ROOT_PARAMETER {
    D3D12_ROOT_PARAMETER {
        ParameterType: D3D12_ROOT_PARAMETER_TYPE_CBV,
        Anonymous: D3D12_ROOT_PARAMETER_0 {
            Descriptor: D3D12_ROOT_DESCRIPTOR {
                ShaderRegister: 0,
                RegisterSpace: 0,
            },
        },
        ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
    }
}

fn serialize_root_signature(
    device: &ID3D12Device,
    desc: &D3D12_ROOT_SIGNATURE_DESC,
) -> Result<ID3D12RootSignature, PipelineError> {
    unsafe {
        let mut signature: Option<ID3DBlob> = None;
        let mut errors: Option<ID3DBlob> = None;
        D3D12SerializeRootSignature(
            desc,
            D3D_ROOT_SIGNATURE_VERSION_1,
            &mut signature,
            Some(&mut errors),
        )
        .map_err(|e| match errors {
            Some(blob) => PipelineError::RootSignature(WinError::new(
                e.code(),
                blob_to_string(&blob),
            )),
            None => PipelineError::RootSignature(e),
        })?;

        let signature = signature.ok_or_else(|| {
            PipelineError::RootSignature(WinError::empty())
        })?;
        device
            .CreateRootSignature(
                0,
                std::slice::from_raw_parts(
                    signature.GetBufferPointer() as *const u8,
                    signature.GetBufferSize(),
                ),
            )
            .map_err(PipelineError::RootSignature)
    }
}

/// Full-screen quad pipeline: position + texcoord layout, no depth, no blend.
pub fn create_graphics_pipeline(
    device: &ID3D12Device,
    root_signature: &ID3D12RootSignature,
    shaders: &ShaderSet,
    target_format: DXGI_FORMAT,
) -> Result<ID3D12PipelineState, PipelineError> {
    let input_elements = [
        D3D12_INPUT_ELEMENT_DESC {
            SemanticName: PCSTR(b"POSITION\0".as_ptr()),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32B32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: 0,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
        D3D12_INPUT_ELEMENT_DESC {
            SemanticName: PCSTR(b"TEXCOORD\0".as_ptr()),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: 12,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
    ];

    let mut rtv_formats = [DXGI_FORMAT::default(); 8];
    rtv_formats[0] = target_format;

    unsafe {
        let desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
            pRootSignature: ManuallyDrop::new(Some(root_signature.clone())),
            VS: bytecode(&shaders.vertex),
            PS: bytecode(&shaders.pixel),
            BlendState: D3D12_BLEND_DESC::default(),
            SampleMask: u32::MAX,
            RasterizerState: D3D12_RASTERIZER_DESC {
                FillMode: D3D12_FILL_MODE_SOLID,
                CullMode: D3D12_CULL_MODE_NONE,
                ..Default::default()
            },
            InputLayout: D3D12_INPUT_LAYOUT_DESC {
                pInputElementDescs: input_elements.as_ptr(),
                NumElements: input_elements.len() as u32,
            },
            PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
            NumRenderTargets: 1,
            RTVFormats: rtv_formats,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            ..Default::default()
        };
        device
            .CreateGraphicsPipelineState(&desc)
            .map_err(PipelineError::PipelineState)
    }
}

pub fn create_compute_pipeline(
    device: &ID3D12Device,
    root_signature: &ID3D12RootSignature,
    kernel: &ID3DBlob,
) -> Result<ID3D12PipelineState, PipelineError> {
    unsafe {
        let desc = D3D12_COMPUTE_PIPELINE_STATE_DESC {
            pRootSignature: ManuallyDrop::new(Some(root_signature.clone())),
            CS: bytecode(kernel),
            ..Default::default()
        };
        device
            .CreateComputePipelineState(&desc)
            .map_err(PipelineError::PipelineState)
    }
}
