use std::time::Duration;

use bevy_lego_ocean::gpu::device::{DeviceKind, DeviceRequirements, VALIDATION_LAYER, select_physical_device};
use bevy_lego_ocean::gpu::error::{FatalError, Subsystem};
use bevy_lego_ocean::gpu::headless::reference_adapter;
use bevy_lego_ocean::gpu::wgpu_backend::{
    FENCE_BACKOFF_MAX, FENCE_BACKOFF_MIN, fence_backoff, instance_layers,
};

#[test]
fn instance_without_a_vulkan_loader_cannot_satisfy_validation() {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::empty(),
        ..Default::default()
    });
    let layers = instance_layers(&instance);
    assert!(layers.is_empty(), "{layers:?}");

    let requirements = DeviceRequirements {
        validation_layer: Some(VALIDATION_LAYER.to_string()),
        ..DeviceRequirements::default()
    };
    let candidates = vec![reference_adapter("dgpu", DeviceKind::Discrete)];
    let err = select_physical_device(&layers, &candidates, &requirements).unwrap_err();
    assert!(matches!(err, FatalError::MissingValidationLayer(_)));
    assert_eq!(err.subsystem(), Subsystem::Device);
}

#[test]
fn fence_waits_sleep_with_a_capped_backoff() {
    let mut sleep = FENCE_BACKOFF_MIN;
    let mut total = Duration::ZERO;
    for _ in 0..20 {
        let next = fence_backoff(sleep);
        assert!(next >= sleep && next <= FENCE_BACKOFF_MAX);
        total += next;
        sleep = next;
    }
    assert_eq!(sleep, FENCE_BACKOFF_MAX);
    // twenty polls span tens of milliseconds instead of spinning
    assert!(total >= Duration::from_millis(20), "{total:?}");
    assert_eq!(fence_backoff(Duration::ZERO), FENCE_BACKOFF_MIN);
}
