use log::debug;
use thiserror::Error;
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL_11_0};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAP_READ,
    D3D11_MAPPED_SUBRESOURCE, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
};
use windows::Win32::Graphics::Direct3D12::{
    D3D12_PLACED_SUBRESOURCE_FOOTPRINT, D3D12_RESOURCE_STATE_COPY_DEST,
    D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE, D3D12_SUBRESOURCE_FOOTPRINT,
    D3D12_TEXTURE_COPY_LOCATION, D3D12_TEXTURE_COPY_LOCATION_0,
    D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT, D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
    ID3D12CommandList, ID3D12Resource,
};
use windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC;
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_WAIT_TIMEOUT,
    DXGI_OUTDUPL_FRAME_INFO, IDXGIFactory1, IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
};
use windows_core::{Error as WinError, Interface};

use crate::gfx::device::{DeviceContext, DeviceError, TARGET_FORMAT, committed_upload_buffer};
use crate::gfx::transition;

/// How long one tick waits for new desktop content. Expiring with no frame is
/// "no update", not an error.
pub const ACQUIRE_TIMEOUT_MS: u32 = 16;

/// Destination rows must start on 256-byte boundaries for the texture copy.
const ROW_PITCH_ALIGNMENT: u32 = 256;

#[derive(Debug, Error)]
pub enum CaptureInitError {
    #[error("failed to create capture device: {0}")]
    Device(WinError),

    #[error("no duplicable output found: {0}")]
    Output(WinError),

    #[error("failed to duplicate output: {0}")]
    Duplicate(WinError),

    #[error("failed to create staging surface: {0}")]
    Staging(WinError),

    #[error(transparent)]
    Upload(#[from] DeviceError),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The duplication session died (display-mode change, different fullscreen
    /// owner); the bridge must be reopened.
    #[error("duplication access lost")]
    AccessLost,

    #[error("frame acquisition failed: {0}")]
    Acquire(WinError),

    #[error("duplication produced no surface")]
    MissingSurface,

    #[error("failed to map {what}: {source}")]
    Map {
        what: &'static str,
        source: WinError,
    },

    #[error("capture upload submission failed: {0}")]
    Submit(WinError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// A new frame was uploaded into the capture texture.
    Updated,
    /// The timeout expired with no new content; the previous capture stands.
    NoUpdate,
}

/// The platform's screen-duplication session plus the D3D11 device it feeds.
pub struct DuplicationSource {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    pub width: u32,
    pub height: u32,
}

impl DuplicationSource {
    /// Opens duplication for the primary output and reads the capture
    /// resolution from its descriptor.
    pub fn open() -> Result<Self, CaptureInitError> {
        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&[D3D_FEATURE_LEVEL_11_0]),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        }
        .map_err(CaptureInitError::Device)?;
        let device = device.ok_or_else(|| CaptureInitError::Device(WinError::empty()))?;
        let context = context.ok_or_else(|| CaptureInitError::Device(WinError::empty()))?;

        let factory: IDXGIFactory1 =
            unsafe { CreateDXGIFactory1() }.map_err(CaptureInitError::Device)?;
        let adapter = unsafe { factory.EnumAdapters(0) }.map_err(CaptureInitError::Output)?;
        let output = unsafe { adapter.EnumOutputs(0) }.map_err(CaptureInitError::Output)?;
        let output1: IDXGIOutput1 = output.cast().map_err(CaptureInitError::Output)?;
        let duplication =
            unsafe { output1.DuplicateOutput(&device) }.map_err(CaptureInitError::Duplicate)?;

        let desc = unsafe { duplication.GetDesc() };
        debug!(
            "duplication opened at {}x{}",
            desc.ModeDesc.Width, desc.ModeDesc.Height
        );

        Ok(Self {
            device,
            context,
            duplication,
            width: desc.ModeDesc.Width,
            height: desc.ModeDesc.Height,
        })
    }
}

/// Bridges duplicated desktop frames into the renderer's capture texture: a
/// CPU-readable staging surface on the capture device plus a GPU-visible
/// upload buffer on the render device. Recreated whenever the capture
/// resolution changes.
pub struct CaptureBridge {
    source: DuplicationSource,
    staging: ID3D11Texture2D,
    upload: ID3D12Resource,
    dst_pitch: u32,
}

impl CaptureBridge {
    pub fn new(source: DuplicationSource, ctx: &DeviceContext) -> Result<Self, CaptureInitError> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: source.width,
            Height: source.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: TARGET_FORMAT,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            ..Default::default()
        };
        let mut staging: Option<ID3D11Texture2D> = None;
        unsafe { source.device.CreateTexture2D(&desc, None, Some(&mut staging)) }
            .map_err(CaptureInitError::Staging)?;
        let staging = staging.ok_or_else(|| CaptureInitError::Staging(WinError::empty()))?;

        let dst_pitch = (source.width * 4).next_multiple_of(ROW_PITCH_ALIGNMENT);
        let upload = committed_upload_buffer(
            &ctx.device,
            dst_pitch as u64 * source.height as u64,
            "capture upload buffer",
        )?;

        Ok(Self {
            source,
            staging,
            upload,
            dst_pitch,
        })
    }

    /// Runs one capture tick: acquire, stage, row-copy into the upload buffer,
    /// then submit the upload into the capture texture and wait for it.
    ///
    /// Every path that acquired a frame releases it exactly once (the drop
    /// guard); the timeout path never acquired one.
    pub fn capture(
        &mut self,
        ctx: &mut DeviceContext,
        slot_index: u32,
    ) -> Result<CaptureOutcome, CaptureError> {
        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        if let Err(e) = unsafe {
            self.source
                .duplication
                .AcquireNextFrame(ACQUIRE_TIMEOUT_MS, &mut frame_info, &mut resource)
        } {
            return match e.code() {
                code if code == DXGI_ERROR_WAIT_TIMEOUT => Ok(CaptureOutcome::NoUpdate),
                code if code == DXGI_ERROR_ACCESS_LOST => Err(CaptureError::AccessLost),
                _ => Err(CaptureError::Acquire(e)),
            };
        }
        let frame = AcquiredFrame {
            duplication: &self.source.duplication,
        };

        let desktop: ID3D11Texture2D = resource
            .ok_or(CaptureError::MissingSurface)?
            .cast()
            .map_err(CaptureError::Acquire)?;
        unsafe { self.source.context.CopyResource(&self.staging, &desktop) };

        let rows = self.source.height as usize;
        let row_bytes = self.source.width as usize * 4;
        let dst_pitch = self.dst_pitch as usize;

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.source
                .context
                .Map(&self.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
        }
        .map_err(|source| CaptureError::Map {
            what: "staging surface",
            source,
        })?;

        let copy_result = (|| {
            let mut upload_ptr: *mut std::ffi::c_void = std::ptr::null_mut();
            unsafe { self.upload.Map(0, None, Some(&mut upload_ptr)) }.map_err(|source| {
                CaptureError::Map {
                    what: "upload buffer",
                    source,
                }
            })?;

            let src_pitch = mapped.RowPitch as usize;
            let src =
                unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, rows * src_pitch) };
            let dst = unsafe {
                std::slice::from_raw_parts_mut(upload_ptr as *mut u8, rows * dst_pitch)
            };
            copy_rows(src, src_pitch, dst, dst_pitch, row_bytes, rows);

            unsafe { self.upload.Unmap(0, None) };
            Ok(())
        })();
        unsafe { self.source.context.Unmap(&self.staging, 0) };
        copy_result?;

        self.submit_upload(ctx, slot_index)
            .map_err(CaptureError::Submit)?;

        drop(frame);
        Ok(CaptureOutcome::Updated)
    }

    /// Records and executes the upload: shader-readable → copy-dest, buffer →
    /// texture copy, back to shader-readable, then a blocking GPU wait.
    fn submit_upload(&self, ctx: &mut DeviceContext, slot_index: u32) -> Result<(), WinError> {
        let list = &ctx.command_list;
        unsafe {
            list.Reset(&ctx.slots[slot_index as usize].allocator, None)?;
        }
        transition(
            list,
            &ctx.screen_texture,
            D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
            D3D12_RESOURCE_STATE_COPY_DEST,
        );

        let dst = D3D12_TEXTURE_COPY_LOCATION {
            pResource: borrowed_resource(&ctx.screen_texture),
            Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                SubresourceIndex: 0,
            },
        };
        let src = D3D12_TEXTURE_COPY_LOCATION {
            pResource: borrowed_resource(&self.upload),
            Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                    Offset: 0,
                    Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                        Format: TARGET_FORMAT,
                        Width: self.source.width,
                        Height: self.source.height,
                        Depth: 1,
                        RowPitch: self.dst_pitch,
                    },
                },
            },
        };
        unsafe { list.CopyTextureRegion(&dst, 0, 0, 0, &src, None) };

        transition(
            list,
            &ctx.screen_texture,
            D3D12_RESOURCE_STATE_COPY_DEST,
            D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
        );
        unsafe {
            list.Close()?;
            let lists = [Some(list.cast::<ID3D12CommandList>()?)];
            ctx.queue.ExecuteCommandLists(&lists);
        }
        ctx.wait_for_gpu()
    }
}

/// Releases the duplicated frame exactly once, on every exit path that reached
/// a successful acquisition.
struct AcquiredFrame<'a> {
    duplication: &'a IDXGIOutputDuplication,
}

impl Drop for AcquiredFrame<'_> {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.duplication.ReleaseFrame() } {
            debug!("frame release failed: {e}");
        }
    }
}

/// Row-by-row copy between surfaces whose strides may disagree: each row moves
/// `min(src_pitch, row_bytes)` bytes and the rest of the destination row is
/// zeroed, so a short source never leaves stale bytes and a long source is
/// never read past the row.
pub(crate) fn copy_rows(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    dst_pitch: usize,
    row_bytes: usize,
    rows: usize,
) {
    let copy_bytes = src_pitch.min(row_bytes);
    for y in 0..rows {
        let src_row = &src[y * src_pitch..y * src_pitch + copy_bytes];
        let dst_row = &mut dst[y * dst_pitch..y * dst_pitch + dst_pitch];
        dst_row[..copy_bytes].copy_from_slice(src_row);
        dst_row[copy_bytes..].fill(0);
    }
}

/// Non-owning copy-location reference; the struct must not outlive the call
/// that consumes it.
fn borrowed_resource(
    resource: &ID3D12Resource,
) -> std::mem::ManuallyDrop<Option<ID3D12Resource>> {
    std::mem::ManuallyDrop::new(unsafe { std::mem::transmute_copy(resource) })
}

#[cfg(test)]
mod tests {
    use super::copy_rows;

    #[test]
    fn wide_source_rows_are_clipped_to_the_destination() {
        // Source stride 8, destination rows 4 bytes wide in a 4-byte pitch.
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0xAA; 8];
        copy_rows(&src, 8, &mut dst, 4, 4, 2);
        assert_eq!(dst, vec![0, 1, 2, 3, 8, 9, 10, 11]);
    }

    #[test]
    fn exact_source_slice_is_never_overread() {
        // The source slice is exactly rows * pitch long; an out-of-bounds read
        // would panic here.
        let src = vec![7u8; 3 * 10];
        let mut dst = vec![0u8; 3 * 12];
        copy_rows(&src, 10, &mut dst, 12, 10, 3);
        assert!(dst.chunks(12).all(|row| row[..10].iter().all(|&b| b == 7)));
    }

    #[test]
    fn short_source_rows_zero_the_remainder() {
        let src = vec![0xFFu8; 2 * 3];
        let mut dst = vec![0xAA; 2 * 8];
        copy_rows(&src, 3, &mut dst, 8, 6, 2);
        for row in dst.chunks(8) {
            assert_eq!(&row[..3], &[0xFF, 0xFF, 0xFF]);
            assert!(row[3..].iter().all(|&b| b == 0), "stale bytes survived");
        }
    }

    #[test]
    fn matching_strides_copy_verbatim() {
        let src: Vec<u8> = (0..24).collect();
        let mut dst = vec![0u8; 24];
        copy_rows(&src, 6, &mut dst, 6, 6, 4);
        assert_eq!(src, dst);
    }
}
