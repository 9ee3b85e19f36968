use crate::backend::BackendError;

pub(crate) const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GpuPower {
    #[default]
    Low,
    High,
}

/// Options for the offscreen device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuOptions {
    pub width: u32,
    pub height: u32,
    pub power: GpuPower,
    /// Ask for a software adapter.
    pub force_fallback_adapter: bool,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            power: GpuPower::Low,
            force_fallback_adapter: false,
        }
    }
}

pub(crate) struct GpuContext {
    pub _instance: wgpu::Instance,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_name: String,
    pub max_dimension: u32,
}

impl GpuContext {
    pub(crate) fn new_headless(options: &GpuOptions) -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let power_preference = match options.power {
            GpuPower::Low => wgpu::PowerPreference::LowPower,
            GpuPower::High => wgpu::PowerPreference::HighPerformance,
        };
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter: options.force_fallback_adapter,
        }))
        .map_err(|err| BackendError::Device(format!("no suitable GPU adapter: {err}")))?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        tracing::debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            "selected GPU adapter"
        );

        let max_dimension = limits.max_texture_dimension_2d;
        if options.width.max(1) > max_dimension || options.height.max(1) > max_dimension {
            return Err(BackendError::Device(format!(
                "GPU max texture dimension is {max_dimension}, requested target is {}x{}",
                options.width, options.height
            )));
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("renderloop device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits,
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| BackendError::Device(format!("failed to create GPU device: {err}")))?;

        device.on_uncaptured_error(Box::new(|error| {
            tracing::error!(error = %error, "uncaptured GPU error");
        }));

        Ok(Self {
            _instance: instance,
            device,
            queue,
            adapter_name: info.name,
            max_dimension,
        })
    }
}

/// Offscreen color attachment the backend draws into.
pub(crate) struct RenderTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl RenderTarget {
    pub(crate) fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("render target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            width,
            height,
        }
    }
}
