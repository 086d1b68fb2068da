use bevy_lego_ocean::gpu::device::{
    DeviceFeatures, DeviceKind, DeviceRequirements, QueueFamilyInfo, QueueFlags, Rejection,
    VALIDATION_LAYER, evaluate, find_queue_families, select_physical_device,
};
use bevy_lego_ocean::gpu::error::{FatalError, Subsystem};
use bevy_lego_ocean::gpu::headless::reference_adapter;

fn family(flags: QueueFlags, present: bool) -> QueueFamilyInfo {
    QueueFamilyInfo {
        flags,
        queue_count: 1,
        present,
    }
}

#[test]
fn queue_flags_must_all_be_present() {
    // graphics-only plus compute-only is not a graphics+compute family
    let mut device = reference_adapter("split", DeviceKind::Discrete);
    device.queue_families = vec![
        family(QueueFlags::GRAPHICS, true),
        family(QueueFlags::COMPUTE, true),
    ];
    let required = QueueFlags::GRAPHICS | QueueFlags::COMPUTE;
    assert_eq!(find_queue_families(&device, required), Err(Rejection::MissingQueueFlags));

    device.queue_families.push(family(required | QueueFlags::TRANSFER, false));
    let families = find_queue_families(&device, required).unwrap();
    assert_eq!(families.graphics, 2);
    assert_eq!(families.present, 0);
    assert!(!families.shared());
}

#[test]
fn combined_family_is_preferred() {
    let mut device = reference_adapter("combined", DeviceKind::Integrated);
    let both = QueueFlags::GRAPHICS | QueueFlags::COMPUTE;
    device.queue_families = vec![
        family(both, false),
        family(QueueFlags::TRANSFER, true),
        family(both, true),
    ];
    let families = find_queue_families(&device, both).unwrap();
    assert_eq!((families.graphics, families.present), (2, 2));
    assert!(families.shared());
}

#[test]
fn no_present_queue_is_rejected() {
    let mut device = reference_adapter("offscreen", DeviceKind::Discrete);
    device.queue_families = vec![family(QueueFlags::GRAPHICS | QueueFlags::COMPUTE, false)];
    assert_eq!(
        evaluate(&device, &DeviceRequirements::default()),
        Err(Rejection::NoPresentQueue)
    );
}

#[test]
fn missing_extension_and_features_are_reported() {
    let mut device = reference_adapter("bare", DeviceKind::Discrete);
    device.extensions.clear();
    assert!(matches!(
        evaluate(&device, &DeviceRequirements::default()),
        Err(Rejection::MissingExtension(_))
    ));

    let mut device = reference_adapter("featureless", DeviceKind::Discrete);
    device.features = DeviceFeatures::default();
    let requirements = DeviceRequirements {
        features: DeviceFeatures {
            geometry_shader: true,
            wide_lines: true,
            ..DeviceFeatures::default()
        },
        ..DeviceRequirements::default()
    };
    assert_eq!(
        evaluate(&device, &requirements),
        Err(Rejection::MissingFeatures(vec!["geometry_shader", "wide_lines"]))
    );
}

#[test]
fn inadequate_surface_is_rejected() {
    let mut device = reference_adapter("no formats", DeviceKind::Discrete);
    device.surface.formats.clear();
    assert_eq!(
        evaluate(&device, &DeviceRequirements::default()),
        Err(Rejection::NoSwapSupport)
    );
}

#[test]
fn discrete_wins_and_ties_go_to_the_first() {
    let candidates = vec![
        reference_adapter("llvmpipe", DeviceKind::Cpu),
        reference_adapter("igpu", DeviceKind::Integrated),
        reference_adapter("dgpu a", DeviceKind::Discrete),
        reference_adapter("dgpu b", DeviceKind::Discrete),
    ];
    let selection = select_physical_device(&[], &candidates, &DeviceRequirements::default()).unwrap();
    assert_eq!(selection.index, 2);
    assert_eq!(selection.name, "dgpu a");
    assert_eq!(selection.kind, DeviceKind::Discrete);
}

#[test]
fn unsuitable_discrete_loses_to_suitable_integrated() {
    let mut broken = reference_adapter("dgpu", DeviceKind::Discrete);
    broken.extensions.clear();
    let candidates = vec![broken, reference_adapter("igpu", DeviceKind::Integrated)];
    let selection = select_physical_device(&[], &candidates, &DeviceRequirements::default()).unwrap();
    assert_eq!(selection.name, "igpu");
}

#[test]
fn nothing_suitable_is_fatal() {
    let err = select_physical_device(&[], &[], &DeviceRequirements::default()).unwrap_err();
    assert!(matches!(err, FatalError::NoSuitableDevice(_)));
    assert_eq!(err.subsystem(), Subsystem::Device);

    let mut broken = reference_adapter("dgpu", DeviceKind::Discrete);
    broken.extensions.clear();
    let err = select_physical_device(&[], &[broken], &DeviceRequirements::default()).unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("device:"), "{message}");
    assert!(message.contains("dgpu"), "{message}");
}

#[test]
fn requested_validation_layer_must_exist() {
    let requirements = DeviceRequirements {
        validation_layer: Some(VALIDATION_LAYER.to_string()),
        ..DeviceRequirements::default()
    };
    let candidates = vec![reference_adapter("dgpu", DeviceKind::Discrete)];

    let err = select_physical_device(&[], &candidates, &requirements).unwrap_err();
    assert!(matches!(err, FatalError::MissingValidationLayer(ref layer) if layer == VALIDATION_LAYER));

    let layers = vec![VALIDATION_LAYER.to_string()];
    assert!(select_physical_device(&layers, &candidates, &requirements).is_ok());
}
