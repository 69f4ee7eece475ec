use log::error;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Graphics::Direct3D12::{
    D3D12_FENCE_FLAG_NONE, ID3D12CommandQueue, ID3D12Device, ID3D12Fence,
};
use windows::Win32::System::Threading::{CreateEventW, INFINITE, WaitForSingleObject};
use windows_core::Result as WinResult;

/// Fence-based CPU/GPU completion tracking.
///
/// One monotonically increasing value, signaled by the queue after each batch of
/// submitted work. [`FrameSync::wait_idle`] blocks until the GPU reaches the
/// latest signal; it is called after every submission, trading CPU/GPU overlap
/// for simplicity at the capped frame rate. A slot's allocator and mapped
/// constant-buffer region may only be reused after this wait returns.
pub struct FrameSync {
    fence: ID3D12Fence,
    event: HANDLE,
    value: u64,
}

impl FrameSync {
    pub fn new(device: &ID3D12Device) -> WinResult<Self> {
        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }?;
        let event = unsafe { CreateEventW(None, false, false, None) }?;
        Ok(Self {
            fence,
            event,
            value: 0,
        })
    }

    /// Blocks until all work submitted to `queue` so far has completed.
    pub fn wait_idle(&mut self, queue: &ID3D12CommandQueue) -> WinResult<()> {
        self.value += 1;
        unsafe { queue.Signal(&self.fence, self.value) }?;
        if unsafe { self.fence.GetCompletedValue() } < self.value {
            unsafe { self.fence.SetEventOnCompletion(self.value, self.event) }?;
            unsafe { WaitForSingleObject(self.event, INFINITE) };
        }
        Ok(())
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        if !self.event.is_invalid()
            && let Err(e) = unsafe { CloseHandle(self.event) }
        {
            error!("failed to close fence event handle: {e}");
        }
    }
}
