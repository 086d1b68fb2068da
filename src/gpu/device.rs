// physical device selection, independent of any concrete GPU API
use std::fmt;
use std::ops::BitOr;

use bevy::log::{debug, info};

use crate::gpu::error::FatalError;
use crate::gpu::swap::SurfaceSupport;

pub const SWAPCHAIN_EXTENSION: &str = "VK_KHR_swapchain";
pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueFlags(u32);

impl QueueFlags {
    pub const GRAPHICS: Self = Self(1 << 0);
    pub const COMPUTE: Self = Self(1 << 1);
    pub const TRANSFER: Self = Self(1 << 2);

    /// True only when every bit of `required` is present.
    #[inline]
    pub fn contains(self, required: Self) -> bool {
        self.0 & required.0 == required.0
    }
}

impl BitOr for QueueFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

impl DeviceKind {
    #[inline]
    fn score(self) -> u32 {
        match self {
            DeviceKind::Discrete => 4,
            DeviceKind::Integrated => 3,
            DeviceKind::Virtual => 2,
            DeviceKind::Cpu => 1,
            DeviceKind::Other => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub flags: QueueFlags,
    pub queue_count: u32,
    pub present: bool, // can present to our surface
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub geometry_shader: bool,
    pub fill_mode_non_solid: bool,
    pub wide_lines: bool,
    pub large_points: bool,
}

impl DeviceFeatures {
    /// Names of the features in `required` that `self` lacks.
    pub fn missing(&self, required: &DeviceFeatures) -> Vec<&'static str> {
        let pairs = [
            (required.geometry_shader, self.geometry_shader, "geometry_shader"),
            (required.fill_mode_non_solid, self.fill_mode_non_solid, "fill_mode_non_solid"),
            (required.wide_lines, self.wide_lines, "wide_lines"),
            (required.large_points, self.large_points, "large_points"),
        ];
        pairs
            .into_iter()
            .filter(|(want, have, _)| *want && !*have)
            .map(|(_, _, name)| name)
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct PhysicalDeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub features: DeviceFeatures,
    pub extensions: Vec<String>,
    pub surface: SurfaceSupport,
}

#[derive(Clone, Debug)]
pub struct DeviceRequirements {
    pub queue_flags: QueueFlags,
    pub features: DeviceFeatures,
    pub extensions: Vec<String>,
    /// `Some` when validation was requested; a missing layer is fatal.
    pub validation_layer: Option<String>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            queue_flags: QueueFlags::GRAPHICS | QueueFlags::COMPUTE,
            features: DeviceFeatures::default(),
            extensions: vec![SWAPCHAIN_EXTENSION.to_string()],
            validation_layer: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Both handles come from the same family, so swap images need no
    /// ownership transfer.
    #[inline]
    pub fn shared(&self) -> bool {
        self.graphics == self.present
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSelection {
    pub index: usize,
    pub name: String,
    pub kind: DeviceKind,
    pub families: QueueFamilies,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    MissingQueueFlags,
    NoPresentQueue,
    MissingFeatures(Vec<&'static str>),
    MissingExtension(String),
    NoSwapSupport,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingQueueFlags => f.write_str("no queue family with graphics and compute"),
            Rejection::NoPresentQueue => f.write_str("no queue family can present"),
            Rejection::MissingFeatures(names) => write!(f, "missing features {}", names.join(", ")),
            Rejection::MissingExtension(ext) => write!(f, "missing extension {ext}"),
            Rejection::NoSwapSupport => f.write_str("surface reports no formats or present modes"),
        }
    }
}

pub fn check_validation_layer(
    available: &[String],
    requirements: &DeviceRequirements,
) -> Result<(), FatalError> {
    let Some(layer) = &requirements.validation_layer else {
        return Ok(());
    };
    if available.iter().any(|l| l == layer) {
        Ok(())
    } else {
        Err(FatalError::MissingValidationLayer(layer.clone()))
    }
}

/// Picks a graphics family with every required flag, then a present family,
/// preferring one family that does both.
pub fn find_queue_families(
    device: &PhysicalDeviceInfo,
    required: QueueFlags,
) -> Result<QueueFamilies, Rejection> {
    let capable = |f: &QueueFamilyInfo| f.queue_count > 0 && f.flags.contains(required);

    if let Some(both) = device.queue_families.iter().position(|f| capable(f) && f.present) {
        return Ok(QueueFamilies {
            graphics: both as u32,
            present: both as u32,
        });
    }

    let graphics = device
        .queue_families
        .iter()
        .position(capable)
        .ok_or(Rejection::MissingQueueFlags)?;
    let present = device
        .queue_families
        .iter()
        .position(|f| f.queue_count > 0 && f.present)
        .ok_or(Rejection::NoPresentQueue)?;

    Ok(QueueFamilies {
        graphics: graphics as u32,
        present: present as u32,
    })
}

pub fn evaluate(
    device: &PhysicalDeviceInfo,
    requirements: &DeviceRequirements,
) -> Result<QueueFamilies, Rejection> {
    let families = find_queue_families(device, requirements.queue_flags)?;

    if let Some(ext) = requirements
        .extensions
        .iter()
        .find(|ext| !device.extensions.contains(ext))
    {
        return Err(Rejection::MissingExtension(ext.clone()));
    }

    let missing = device.features.missing(&requirements.features);
    if !missing.is_empty() {
        return Err(Rejection::MissingFeatures(missing));
    }

    if !device.surface.is_adequate() {
        return Err(Rejection::NoSwapSupport);
    }

    Ok(families)
}

/// Selects exactly one device. Higher device class wins; ties go to the
/// device enumerated first.
pub fn select_physical_device(
    available_layers: &[String],
    candidates: &[PhysicalDeviceInfo],
    requirements: &DeviceRequirements,
) -> Result<DeviceSelection, FatalError> {
    check_validation_layer(available_layers, requirements)?;

    let mut best: Option<(u32, DeviceSelection)> = None;
    let mut rejected = Vec::new();

    for (index, device) in candidates.iter().enumerate() {
        match evaluate(device, requirements) {
            Ok(families) => {
                let score = device.kind.score();
                if best.as_ref().is_none_or(|(s, _)| score > *s) {
                    best = Some((
                        score,
                        DeviceSelection {
                            index,
                            name: device.name.clone(),
                            kind: device.kind,
                            families,
                        },
                    ));
                }
            }
            Err(reason) => {
                debug!("device: rejected {}: {reason}", device.name);
                rejected.push(format!("{}: {reason}", device.name));
            }
        }
    }

    match best {
        Some((_, selection)) => {
            info!(
                "device: selected {} ({:?}), graphics family {}, present family {}",
                selection.name, selection.kind, selection.families.graphics, selection.families.present
            );
            Ok(selection)
        }
        None if candidates.is_empty() => {
            Err(FatalError::NoSuitableDevice("no devices enumerated".to_string()))
        }
        None => Err(FatalError::NoSuitableDevice(rejected.join("; "))),
    }
}
