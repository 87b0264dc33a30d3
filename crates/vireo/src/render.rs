//! Renderer tiers and the fallback chain.
//!
//! Three tiers behind one contract, selected once at initialization and
//! never re-attempted per frame:
//!
//! 1. GPU, high-performance adapter (wgpu)
//! 2. GPU, fallback adapter (wgpu software/downlevel rasterizer)
//! 3. CPU raster into a shared framebuffer
//!
//! A tier that fails to initialize falls through to the next; all three
//! failing is fatal to playback. Every tier consumes tightly packed RGBA
//! pixels — pixel-format conversion is the decoder side's job.

use std::borrow::Cow;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RenderError;

/// wgpu requires texture upload rows aligned to this many bytes.
const COPY_ALIGN: u32 = 256;

/// Which tier ended up selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    GpuHighPerformance,
    GpuFallback,
    Raster,
}

/// One renderer tier. `render_frame` draws a full RGBA frame; `resize`
/// records the output size and must be cheap and idempotent; `destroy`
/// releases resources and is terminal.
pub trait Renderer: Send {
    fn kind(&self) -> RendererKind;
    fn render_frame(&mut self, pixels: &[u8], width: u32, height: u32)
        -> Result<(), RenderError>;
    fn resize(&mut self, width: u32, height: u32);
    fn destroy(&mut self);

    /// The CPU tier exposes its output for embedders that blit manually;
    /// GPU tiers render into their own target and return `None`.
    fn framebuffer(&self) -> Option<SharedFramebuffer> {
        None
    }
}

/// Walks the tier chain: GPU high-performance, GPU fallback adapter, CPU
/// raster. Returns the first tier that initializes.
pub fn select_renderer() -> Result<Box<dyn Renderer>, RenderError> {
    match GpuRenderer::new(false) {
        Ok(renderer) => {
            tracing::info!("renderer: GPU (high-performance adapter)");
            return Ok(Box::new(renderer));
        }
        Err(e) => tracing::warn!("GPU renderer unavailable, trying fallback adapter: {e}"),
    }
    match GpuRenderer::new(true) {
        Ok(renderer) => {
            tracing::info!("renderer: GPU (fallback adapter)");
            return Ok(Box::new(renderer));
        }
        Err(e) => tracing::warn!("GPU fallback renderer unavailable, trying raster: {e}"),
    }
    match RasterRenderer::new() {
        Ok(renderer) => {
            tracing::info!("renderer: CPU raster");
            Ok(Box::new(renderer))
        }
        Err(e) => Err(RenderError::NoRenderer(format!(
            "all renderer tiers failed, last: {e}"
        ))),
    }
}

// ============================================================================
// GPU tiers
// ============================================================================

/// wgpu-backed renderer: uploads the frame to a texture and blits it into
/// an offscreen target with a fullscreen triangle. The same type serves
/// both GPU tiers; the fallback tier only differs in adapter selection.
pub struct GpuRenderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    source: Option<FrameTexture>,
    target: Option<TargetTexture>,
    target_size: (u32, u32),
    fallback_adapter: bool,
    destroyed: bool,
}

struct FrameTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
}

struct TargetTexture {
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl GpuRenderer {
    /// Initializes the tier. `fallback_adapter` requests wgpu's software/
    /// downlevel adapter instead of the high-performance one.
    pub fn new(fallback_adapter: bool) -> Result<Self, RenderError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = futures::executor::block_on(instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: fallback_adapter,
                compatible_surface: None,
            },
        ))
        .ok_or_else(|| {
            RenderError::TierUnavailable(if fallback_adapter {
                "no fallback adapter".into()
            } else {
                "no suitable GPU adapter".into()
            })
        })?;

        let (device, queue) = futures::executor::block_on(
            adapter.request_device(&wgpu::DeviceDescriptor::default(), None),
        )
        .map_err(|e| RenderError::TierUnavailable(format!("request device: {e}")))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("frame_blit_shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("render.wgsl"))),
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("frame_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("frame_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("frame_blit_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("frame_blit_pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            source: None,
            target: None,
            target_size: (0, 0),
            fallback_adapter,
            destroyed: false,
        })
    }

    fn ensure_source(&mut self, width: u32, height: u32) {
        let stale = match &self.source {
            Some(s) => s.width != width || s.height != height,
            None => true,
        };
        if !stale {
            return;
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("frame_texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("frame_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        self.source = Some(FrameTexture {
            texture,
            bind_group,
            width,
            height,
        });
    }

    fn ensure_target(&mut self, frame_width: u32, frame_height: u32) {
        let (mut width, mut height) = self.target_size;
        if width == 0 || height == 0 {
            width = frame_width;
            height = frame_height;
        }
        let stale = match &self.target {
            Some(t) => t.width != width || t.height != height,
            None => true,
        };
        if !stale {
            return;
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("frame_target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.target = Some(TargetTexture {
            view,
            width,
            height,
        });
    }
}

/// Pads rows to wgpu's copy alignment. Borrows when already aligned.
fn pad_rows(data: &[u8], bytes_per_row: u32, rows: u32) -> (u32, Cow<'_, [u8]>) {
    let aligned = (bytes_per_row + COPY_ALIGN - 1) & !(COPY_ALIGN - 1);
    if aligned == bytes_per_row {
        return (bytes_per_row, Cow::Borrowed(data));
    }
    let mut padded = Vec::with_capacity((aligned * rows) as usize);
    for row in 0..rows as usize {
        let start = row * bytes_per_row as usize;
        let end = (start + bytes_per_row as usize).min(data.len());
        padded.extend_from_slice(&data[start..end]);
        padded.resize((row + 1) * aligned as usize, 0);
    }
    (aligned, Cow::Owned(padded))
}

impl Renderer for GpuRenderer {
    fn kind(&self) -> RendererKind {
        if self.fallback_adapter {
            RendererKind::GpuFallback
        } else {
            RendererKind::GpuHighPerformance
        }
    }

    fn render_frame(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        if self.destroyed {
            return Err(RenderError::RenderFailed("renderer destroyed".into()));
        }
        if pixels.len() < (width * height * 4) as usize {
            return Err(RenderError::RenderFailed(format!(
                "pixel buffer {} too small for {width}x{height}",
                pixels.len()
            )));
        }

        self.ensure_source(width, height);
        self.ensure_target(width, height);

        let source = self.source.as_ref().expect("source texture just ensured");
        let (bytes_per_row, data) = pad_rows(pixels, width * 4, height);
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );

        let target = self.target.as_ref().expect("target texture just ensured");
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame_blit"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("frame_blit_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &source.bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        // Record only; the target is rebuilt lazily on the next frame.
        self.target_size = (width, height);
    }

    fn destroy(&mut self) {
        self.source = None;
        self.target = None;
        self.destroyed = true;
    }
}

// ============================================================================
// CPU raster tier
// ============================================================================

/// Last-rendered frame, shared with the embedder for manual blitting.
#[derive(Clone, Default)]
pub struct SharedFramebuffer {
    inner: Arc<Mutex<Framebuffer>>,
}

/// RGBA framebuffer contents.
#[derive(Default)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// Bumped on every rendered frame.
    pub frame_counter: u64,
}

impl SharedFramebuffer {
    /// Runs `f` over the current framebuffer contents.
    pub fn read<R>(&self, f: impl FnOnce(&Framebuffer) -> R) -> R {
        f(&self.inner.lock())
    }
}

/// CPU tier: copies the frame into the shared framebuffer. Always
/// available; the floor of the fallback chain.
pub struct RasterRenderer {
    framebuffer: SharedFramebuffer,
    destroyed: bool,
}

impl RasterRenderer {
    pub fn new() -> Result<Self, RenderError> {
        Ok(Self {
            framebuffer: SharedFramebuffer::default(),
            destroyed: false,
        })
    }
}

impl Renderer for RasterRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Raster
    }

    fn render_frame(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        if self.destroyed {
            return Err(RenderError::RenderFailed("renderer destroyed".into()));
        }
        let expected = (width * height * 4) as usize;
        if pixels.len() < expected {
            return Err(RenderError::RenderFailed(format!(
                "pixel buffer {} too small for {width}x{height}",
                pixels.len()
            )));
        }
        let mut fb = self.framebuffer.inner.lock();
        fb.width = width;
        fb.height = height;
        fb.pixels.clear();
        fb.pixels.extend_from_slice(&pixels[..expected]);
        fb.frame_counter += 1;
        Ok(())
    }

    fn resize(&mut self, _width: u32, _height: u32) {
        // Presentation size is the embedder's concern on the CPU tier; the
        // framebuffer always carries the frame at its coded size.
    }

    fn destroy(&mut self) {
        self.destroyed = true;
    }

    fn framebuffer(&self) -> Option<SharedFramebuffer> {
        Some(self.framebuffer.clone())
    }
}
