pub mod adapter;
pub mod capture;
pub mod device;
pub mod pipeline;
pub mod recovery;
pub mod renderer;
pub mod sync;

use std::mem::ManuallyDrop;

use windows::Win32::Graphics::Direct3D12::{
    D3D12_CPU_DESCRIPTOR_HANDLE, D3D12_GPU_DESCRIPTOR_HANDLE, D3D12_RESOURCE_BARRIER,
    D3D12_RESOURCE_BARRIER_0, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
    D3D12_RESOURCE_BARRIER_FLAG_NONE, D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
    D3D12_RESOURCE_STATES, D3D12_RESOURCE_TRANSITION_BARRIER, ID3D12DescriptorHeap,
    ID3D12GraphicsCommandList, ID3D12Resource,
};

/// GPU constant-buffer addresses must fall on 256-byte boundaries.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

pub(crate) fn align_constant_buffer_size(size: u64) -> u64 {
    (size + CONSTANT_BUFFER_ALIGNMENT - 1) & !(CONSTANT_BUFFER_ALIGNMENT - 1)
}

pub(crate) fn cpu_descriptor(
    heap: &ID3D12DescriptorHeap,
    index: u32,
    increment: u32,
) -> D3D12_CPU_DESCRIPTOR_HANDLE {
    let start = unsafe { heap.GetCPUDescriptorHandleForHeapStart() };
    D3D12_CPU_DESCRIPTOR_HANDLE {
        ptr: start.ptr + (index * increment) as usize,
    }
}

pub(crate) fn gpu_descriptor(
    heap: &ID3D12DescriptorHeap,
    index: u32,
    increment: u32,
) -> D3D12_GPU_DESCRIPTOR_HANDLE {
    let start = unsafe { heap.GetGPUDescriptorHandleForHeapStart() };
    D3D12_GPU_DESCRIPTOR_HANDLE {
        ptr: start.ptr + (index * increment) as u64,
    }
}

/// Records a state-transition barrier.
///
/// The barrier borrows the resource for the duration of the call; `ManuallyDrop`
/// keeps the descriptor from releasing a COM reference it never took.
pub(crate) fn transition(
    list: &ID3D12GraphicsCommandList,
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) {
    let borrowed: Option<ID3D12Resource> = unsafe { std::mem::transmute_copy(resource) };
    let barrier = D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: ManuallyDrop::new(borrowed),
                StateBefore: before,
                StateAfter: after,
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
            }),
        },
    };
    unsafe { list.ResourceBarrier(&[barrier]) };
}

#[cfg(test)]
mod tests {
    use super::align_constant_buffer_size;

    #[test]
    fn constant_buffer_sizes_round_up_to_256() {
        assert_eq!(align_constant_buffer_size(0), 0);
        assert_eq!(align_constant_buffer_size(1), 256);
        assert_eq!(align_constant_buffer_size(128), 256);
        assert_eq!(align_constant_buffer_size(256), 256);
        assert_eq!(align_constant_buffer_size(257), 512);
    }
}
