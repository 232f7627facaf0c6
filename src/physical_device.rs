use crate::backend::RaytracingDevice;

/// A `major.minor` tier or version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureLevel {
    pub major: u8,
    pub minor: u8,
}

impl FeatureLevel {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub raytracing_tier: FeatureLevel,
    pub shader_model: FeatureLevel,
    pub resource_binding_tier: u32,
    pub root_signature_version: FeatureLevel,
    pub gpu_upload_heap: bool,
}

impl DeviceCapabilities {
    pub const MIN_RAYTRACING_TIER: FeatureLevel = FeatureLevel::new(1, 1);
    pub const MIN_SHADER_MODEL: FeatureLevel = FeatureLevel::new(6, 6);
    pub const MIN_RESOURCE_BINDING_TIER: u32 = 2;
    pub const MIN_ROOT_SIGNATURE_VERSION: FeatureLevel = FeatureLevel::new(1, 1);

    /// Names of the requirements this device fails to meet.
    pub fn missing_requirements(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.raytracing_tier < Self::MIN_RAYTRACING_TIER {
            missing.push("raytracing tier 1.1");
        }
        if self.shader_model < Self::MIN_SHADER_MODEL {
            missing.push("shader model 6.6");
        }
        if self.resource_binding_tier < Self::MIN_RESOURCE_BINDING_TIER {
            missing.push("resource binding tier 2");
        }
        if self.root_signature_version < Self::MIN_ROOT_SIGNATURE_VERSION {
            missing.push("root signature 1.1");
        }
        if !self.gpu_upload_heap {
            missing.push("gpu upload heap");
        }
        missing
    }
    pub fn supports_raytracing(&self) -> bool {
        self.missing_requirements().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub min_acceleration_structure_scratch_offset_alignment: u32,
    pub acceleration_structure_alignment: u32,
    pub constant_buffer_alignment: u32,
    pub max_descriptor_heap_size: u32,
    pub max_sampler_heap_size: u32,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            min_acceleration_structure_scratch_offset_alignment: 256,
            acceleration_structure_alignment: 256,
            constant_buffer_alignment: 256,
            max_descriptor_heap_size: 1 << 20,
            max_sampler_heap_size: 1 << 10,
        }
    }
}

pub struct PhysicalDevice {
    capabilities: DeviceCapabilities,
    properties: DeviceProperties,
}

impl PhysicalDevice {
    pub fn probe(device: &dyn RaytracingDevice) -> Self {
        let capabilities = device.capabilities();
        let properties = device.properties();
        let missing = capabilities.missing_requirements();
        if missing.is_empty() {
            tracing::info!(
                raytracing_tier = %capabilities.raytracing_tier,
                shader_model = %capabilities.shader_model,
                "raytracing supported"
            );
        } else {
            tracing::warn!(?missing, "raytracing unsupported on this device");
        }
        Self {
            capabilities,
            properties,
        }
    }
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }
    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }
}
