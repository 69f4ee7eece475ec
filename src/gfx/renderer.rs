use log::{debug, info, warn};
use thiserror::Error;
use windows::Win32::Foundation::{HWND, RECT};
use windows::Win32::Graphics::Direct3D::D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP;
use windows::Win32::Graphics::Direct3D12::{
    D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE, D3D12_RESOURCE_STATE_PRESENT,
    D3D12_RESOURCE_STATE_RENDER_TARGET, D3D12_RESOURCE_STATE_UNORDERED_ACCESS, D3D12_VIEWPORT,
    ID3D12CommandList,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory2, DXGI_CREATE_FACTORY_FLAGS, DXGI_ERROR_DEVICE_HUNG,
    DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET, DXGI_PRESENT, IDXGIAdapter1, IDXGIFactory6,
};
use windows_core::{Error as WinError, HRESULT, Interface};

use crate::config::ConfigHandle;
use crate::gfx::adapter::{AdapterError, select_adapter};
use crate::gfx::capture::{CaptureBridge, CaptureError, CaptureOutcome, DuplicationSource};
use crate::gfx::device::{
    DeviceContext, DeviceError, FOG_UAV_INDEX, PipelineOptions, SCREEN_SRV_INDEX,
};
use crate::gfx::pipeline::{PipelineError, ShaderSet};
use crate::gfx::recovery::{RecoveryPhase, RecoveryState};
use crate::gfx::{gpu_descriptor, transition};

/// Fixed per-tick advance of the effect clock. Deliberately not wall-clock:
/// the illusion animates at tick rate regardless of frame pacing.
pub const TIME_STEP: f32 = 0.016;

const CLEAR_COLOR: [f32; 4] = [0.2, 0.3, 0.4, 1.0];
const FALLBACK_CLEAR_COLOR: [f32; 4] = [0.5, 0.0, 0.0, 1.0];

#[derive(Debug, Error)]
pub enum RendererInitError {
    #[error("failed to create DXGI factory: {0}")]
    Factory(WinError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("no device")]
    NoDevice,

    #[error("back buffer index {0} has no frame slot")]
    BadSlot(u32),

    #[error("device removed or hung ({0:?})")]
    DeviceLost(HRESULT),

    #[error("presentation failed: {0}")]
    Present(WinError),

    #[error("frame submission failed: {0}")]
    Submit(WinError),
}

/// Owns the full capture→compute→render→present pipeline and its recovery
/// lifecycle. Lives on the render thread; the only state shared with the event
/// thread is the [`ConfigHandle`].
pub struct Renderer {
    factory: IDXGIFactory6,
    adapter: Option<IDXGIAdapter1>,
    hwnd: HWND,
    shaders: ShaderSet,
    options: PipelineOptions,
    config: ConfigHandle,
    ctx: Option<DeviceContext>,
    bridge: Option<CaptureBridge>,
    recovery: RecoveryState,
    time: f32,
    fallback_size: (u32, u32),
    fallback_idle_logged: bool,
}

impl Renderer {
    /// Builds the renderer: shader kernels, factory, adapter, device, capture
    /// bridge. The capture resolution (when duplication is available) drives
    /// the surface sizes; `fallback_size` (the overlay window size) is used
    /// otherwise.
    pub fn new(
        hwnd: HWND,
        fallback_size: (u32, u32),
        config: ConfigHandle,
        options: PipelineOptions,
    ) -> Result<Self, RendererInitError> {
        let shaders = ShaderSet::load()?;
        let factory: IDXGIFactory6 = unsafe { CreateDXGIFactory2(DXGI_CREATE_FACTORY_FLAGS(0)) }
            .map_err(RendererInitError::Factory)?;
        let adapter = select_adapter(&factory)?;

        let source = match DuplicationSource::open() {
            Ok(source) => Some(source),
            Err(e) => {
                warn!("desktop duplication unavailable at startup: {e}");
                None
            }
        };
        let (width, height) = source
            .as_ref()
            .map(|s| (s.width, s.height))
            .unwrap_or(fallback_size);

        let ctx = DeviceContext::create(
            &factory,
            adapter.as_ref(),
            hwnd,
            width,
            height,
            &shaders,
            &config.snapshot(),
            options,
        )?;

        let bridge = source.and_then(|source| match CaptureBridge::new(source, &ctx) {
            Ok(bridge) => Some(bridge),
            Err(e) => {
                warn!("capture bridge creation failed: {e}");
                None
            }
        });

        Ok(Self {
            factory,
            adapter,
            hwnd,
            shaders,
            options,
            config,
            ctx: Some(ctx),
            bridge,
            recovery: RecoveryState::new(),
            time: 0.0,
            fallback_size,
            fallback_idle_logged: false,
        })
    }

    /// One iteration of the render loop: capture, render, present, or the
    /// recovery/fallback path the state machine dictates. Never panics and
    /// never recurses; every failure is absorbed here.
    pub fn tick(&mut self) {
        match self.recovery.phase() {
            RecoveryPhase::Fallback => self.fallback_tick(),
            RecoveryPhase::Recovering => {
                if self.attempt_recovery() {
                    self.active_tick();
                } else if self.recovery.phase() == RecoveryPhase::Fallback {
                    self.fallback_tick();
                }
            }
            RecoveryPhase::Healthy => self.active_tick(),
        }
    }

    fn active_tick(&mut self) {
        self.capture_tick();
        match self.render_frame() {
            Ok(()) => {}
            Err(FrameError::DeviceLost(code)) => {
                warn!("presentation reported device loss ({code:?})");
                self.recovery.on_device_lost();
                if self.attempt_recovery() {
                    // One retry after a successful in-tick recovery.
                    if let Err(e) = self.render_frame() {
                        warn!("render retry after recovery failed: {e}");
                    }
                }
            }
            Err(e) => warn!("frame dropped: {e}"),
        }
    }

    /// Pulls one desktop frame into the capture texture. All failures here are
    /// transient: the tick continues with the previous capture.
    fn capture_tick(&mut self) {
        if self.bridge.is_none() {
            self.reopen_bridge();
        }
        let (Some(ctx), Some(bridge)) = (self.ctx.as_mut(), self.bridge.as_mut()) else {
            return;
        };
        let slot_index = ctx.current_back_buffer_index();
        match bridge.capture(ctx, slot_index) {
            Ok(CaptureOutcome::Updated) => debug!("desktop frame captured"),
            Ok(CaptureOutcome::NoUpdate) => {
                debug!("capture acquisition timed out, keeping previous frame")
            }
            Err(CaptureError::AccessLost) => {
                warn!("duplication access lost, reopening on the next tick");
                self.bridge = None;
            }
            Err(e) => warn!("capture skipped this tick: {e}"),
        }
    }

    fn reopen_bridge(&mut self) {
        let source = match DuplicationSource::open() {
            Ok(source) => source,
            Err(e) => {
                debug!("duplication still unavailable: {e}");
                return;
            }
        };
        // A mode change resizes the duplication output; every surface derived
        // from the capture resolution has to be rebuilt with it.
        let resized = self
            .ctx
            .as_ref()
            .is_some_and(|c| (c.width, c.height) != (source.width, source.height));
        if resized {
            info!(
                "capture resolution changed to {}x{}, rebuilding device resources",
                source.width, source.height
            );
            if let Err(e) = self.recreate_at(source.width, source.height) {
                warn!("device rebuild for new capture resolution failed: {e}");
                return;
            }
        }
        let Some(ctx) = self.ctx.as_ref() else { return };
        match CaptureBridge::new(source, ctx) {
            Ok(bridge) => self.bridge = Some(bridge),
            Err(e) => warn!("capture bridge creation failed: {e}"),
        }
    }

    /// The per-tick render sequence against the current back buffer.
    fn render_frame(&mut self) -> Result<(), FrameError> {
        let config = self.config.snapshot();
        self.time += TIME_STEP;
        let mut frame_config = config;
        frame_config.time = self.time;

        let ctx = self.ctx.as_mut().ok_or(FrameError::NoDevice)?;
        let slot_index = ctx.current_back_buffer_index();
        let slot = ctx
            .slots
            .get(slot_index as usize)
            .ok_or(FrameError::BadSlot(slot_index))?;

        unsafe { slot.allocator.Reset() }.map_err(submit_error)?;
        let list = &ctx.command_list;
        unsafe { list.Reset(&slot.allocator, None) }.map_err(submit_error)?;

        let heaps = [
            Some(ctx.srv_heap.clone()),
            Some(ctx.sampler_heap.clone()),
        ];

        // Optional compute pre-pass. It shares the command list with the draw
        // below; bindings do not survive the pipeline switch, so the graphics
        // state is re-asserted from scratch afterwards.
        if config.enable_volumetric_fog != 0
            && let (Some(compute), Some(fog)) = (&ctx.compute, &ctx.fog_texture)
        {
            transition(
                list,
                fog,
                D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
                D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
            );
            unsafe {
                list.SetPipelineState(&compute.state);
                list.SetComputeRootSignature(&compute.root_signature);
                list.SetDescriptorHeaps(&heaps);
                list.SetComputeRootDescriptorTable(
                    0,
                    gpu_descriptor(&ctx.srv_heap, SCREEN_SRV_INDEX, ctx.srv_increment),
                );
                list.SetComputeRootDescriptorTable(
                    1,
                    gpu_descriptor(&ctx.srv_heap, FOG_UAV_INDEX, ctx.srv_increment),
                );
                list.SetComputeRootConstantBufferView(
                    2,
                    slot.constant_buffer.GetGPUVirtualAddress(),
                );
                list.Dispatch(ctx.width.div_ceil(16), ctx.height.div_ceil(16), 1);
            }
            transition(
                list,
                fog,
                D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
                D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
            );
        }

        // The slot's fence wait from its previous submission has already
        // returned (every submission blocks), so the mapped region is free.
        slot.write_constants(&frame_config);

        transition(
            list,
            &slot.render_target,
            D3D12_RESOURCE_STATE_PRESENT,
            D3D12_RESOURCE_STATE_RENDER_TARGET,
        );

        let rtv = ctx.rtv_handle(slot_index);
        unsafe {
            list.OMSetRenderTargets(1, Some(&rtv), false, None);
            list.ClearRenderTargetView(rtv, &CLEAR_COLOR, None);

            list.SetPipelineState(&ctx.graphics.state);
            list.SetGraphicsRootSignature(&ctx.graphics.root_signature);
            list.SetGraphicsRootConstantBufferView(2, slot.constant_buffer.GetGPUVirtualAddress());
            list.SetDescriptorHeaps(&heaps);
            list.SetGraphicsRootDescriptorTable(
                0,
                gpu_descriptor(&ctx.srv_heap, SCREEN_SRV_INDEX, ctx.srv_increment),
            );
            list.SetGraphicsRootDescriptorTable(1, gpu_descriptor(&ctx.sampler_heap, 0, 0));

            list.RSSetViewports(&[D3D12_VIEWPORT {
                Width: ctx.width as f32,
                Height: ctx.height as f32,
                MaxDepth: 1.0,
                ..Default::default()
            }]);
            list.RSSetScissorRects(&[RECT {
                right: ctx.width as i32,
                bottom: ctx.height as i32,
                ..Default::default()
            }]);

            list.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP);
            list.IASetVertexBuffers(0, Some(&[ctx.vertex_view]));
            list.DrawInstanced(4, 1, 0, 0);
        }

        transition(
            list,
            &slot.render_target,
            D3D12_RESOURCE_STATE_RENDER_TARGET,
            D3D12_RESOURCE_STATE_PRESENT,
        );

        submit_and_present(ctx)
    }

    /// One bounded recovery attempt. Success resets the configuration to its
    /// documented defaults.
    fn attempt_recovery(&mut self) -> bool {
        if !self.recovery.begin_attempt() {
            return false;
        }
        match self.recreate_current() {
            Ok(()) => {
                self.recovery.on_attempt_succeeded();
                self.config.reset_to_defaults();
                true
            }
            Err(e) => {
                warn!(
                    "device recreation failed (attempt {}): {e}",
                    self.recovery.attempts()
                );
                self.recovery.on_attempt_failed();
                false
            }
        }
    }

    fn recreate_current(&mut self) -> Result<(), DeviceError> {
        let (width, height) = self
            .ctx
            .as_ref()
            .map(|c| (c.width, c.height))
            .unwrap_or(self.fallback_size);
        self.recreate_at(width, height)
    }

    /// Full teardown and rebuild of everything device-dependent. The factory,
    /// adapter, and window handle are preserved across the rebuild.
    fn recreate_at(&mut self, width: u32, height: u32) -> Result<(), DeviceError> {
        self.bridge = None;
        self.ctx = None;
        let ctx = DeviceContext::create(
            &self.factory,
            self.adapter.as_ref(),
            self.hwnd,
            width,
            height,
            &self.shaders,
            &self.config.snapshot(),
            self.options,
        )?;
        self.ctx = Some(ctx);
        self.fallback_idle_logged = false;
        Ok(())
    }

    /// Degraded loop: a solid clear and present, bypassing capture, compute,
    /// and the effects pipeline. Keeps the process alive and visibly
    /// responsive. Failures here are logged only, never routed into recovery.
    fn fallback_tick(&mut self) {
        let Some(ctx) = self.ctx.as_mut() else {
            if !self.fallback_idle_logged {
                warn!("fallback renderer has no device, overlay is idle");
                self.fallback_idle_logged = true;
            }
            return;
        };
        if let Err(e) = render_solid_clear(ctx) {
            warn!("fallback frame failed: {e}");
        }
    }
}

fn render_solid_clear(ctx: &mut DeviceContext) -> Result<(), FrameError> {
    let slot_index = ctx.current_back_buffer_index();
    let slot = ctx
        .slots
        .get(slot_index as usize)
        .ok_or(FrameError::BadSlot(slot_index))?;

    unsafe { slot.allocator.Reset() }.map_err(submit_error)?;
    let list = &ctx.command_list;
    unsafe { list.Reset(&slot.allocator, None) }.map_err(submit_error)?;

    transition(
        list,
        &slot.render_target,
        D3D12_RESOURCE_STATE_PRESENT,
        D3D12_RESOURCE_STATE_RENDER_TARGET,
    );
    let rtv = ctx.rtv_handle(slot_index);
    unsafe {
        list.OMSetRenderTargets(1, Some(&rtv), false, None);
        list.ClearRenderTargetView(rtv, &FALLBACK_CLEAR_COLOR, None);
    }
    transition(
        list,
        &slot.render_target,
        D3D12_RESOURCE_STATE_RENDER_TARGET,
        D3D12_RESOURCE_STATE_PRESENT,
    );

    submit_and_present(ctx)
}

/// Closes and executes the command list, presents with a vsync interval of 1
/// (throughput capped to display refresh), and blocks until the GPU finishes.
fn submit_and_present(ctx: &mut DeviceContext) -> Result<(), FrameError> {
    unsafe {
        ctx.command_list.Close().map_err(submit_error)?;
        let lists = [Some(
            ctx.command_list
                .cast::<ID3D12CommandList>()
                .map_err(submit_error)?,
        )];
        ctx.queue.ExecuteCommandLists(&lists);
    }

    let hr = unsafe { ctx.swapchain.Present(1, DXGI_PRESENT(0)) };
    if hr.is_err() {
        if is_device_loss(hr) {
            return Err(FrameError::DeviceLost(hr));
        }
        return Err(FrameError::Present(WinError::from_hresult(hr)));
    }

    ctx.wait_for_gpu().map_err(submit_error)
}

fn is_device_loss(code: HRESULT) -> bool {
    code == DXGI_ERROR_DEVICE_REMOVED || code == DXGI_ERROR_DEVICE_HUNG || code == DXGI_ERROR_DEVICE_RESET
}

/// Device-loss codes surfacing through any submission step get routed into
/// recovery like a failed present would.
fn submit_error(e: WinError) -> FrameError {
    if is_device_loss(e.code()) {
        FrameError::DeviceLost(e.code())
    } else {
        FrameError::Submit(e)
    }
}
