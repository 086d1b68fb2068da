use std::path::PathBuf;

use bevy_lego_ocean::gpu::backend::{BindingKind, LayoutEntry, ShaderStage, StageFlags};
use bevy_lego_ocean::gpu::device::DeviceRequirements;
use bevy_lego_ocean::gpu::error::{FatalError, Subsystem};
use bevy_lego_ocean::gpu::headless::{HeadlessBackend, HeadlessConfig};
use bevy_lego_ocean::gpu::pipeline::{COMPUTE_LAYOUT, DRAW_LAYOUT};
use bevy_lego_ocean::gpu::shaders::{ShaderLibrary, ShaderSet, check_interface, validate_wgsl};

fn backend() -> HeadlessBackend {
    HeadlessBackend::open(HeadlessConfig::default(), &DeviceRequirements::default()).unwrap()
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lego_ocean_{name}_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn file_names_follow_the_stage_suffix() {
    assert_eq!(ShaderLibrary::file_name("ocean", ShaderStage::Vertex), "ocean.vert.wgsl");
    assert_eq!(ShaderLibrary::file_name("ocean", ShaderStage::Fragment), "ocean.frag.wgsl");
    assert_eq!(ShaderLibrary::file_name("ocean", ShaderStage::Compute), "ocean.comp.wgsl");
}

#[test]
fn builtin_set_compiles_every_stage() {
    let backend = backend();
    let set = ShaderSet::load(&backend, &ShaderLibrary::builtin(), "lego_ocean").unwrap();
    assert_eq!(set.vertex.stage, ShaderStage::Vertex);
    assert_eq!(set.fragment.stage, ShaderStage::Fragment);
    assert_eq!(set.compute.stage, ShaderStage::Compute);
    assert_eq!(set.compute.name, "lego_ocean.comp.wgsl");
}

#[test]
fn unknown_shader_is_a_pipeline_failure() {
    let backend = backend();
    let err = ShaderSet::load(&backend, &ShaderLibrary::empty(), "missing").err().unwrap();
    assert!(matches!(err, FatalError::ShaderNotFound(ref file) if file == "missing.vert.wgsl"));
    assert_eq!(err.subsystem(), Subsystem::Pipeline);
    assert!(err.to_string().starts_with("pipeline:"));
}

#[test]
fn missing_entry_point_fails_to_compile() {
    let backend = backend();
    let mut library = ShaderLibrary::builtin();
    library.insert("lego_ocean", ShaderStage::Compute, "@compute @workgroup_size(1) fn main() {}");

    let err = ShaderSet::load(&backend, &library, "lego_ocean").err().unwrap();
    let FatalError::ShaderCompile { name, message } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(name, "lego_ocean.comp.wgsl");
    assert!(message.contains("cs_main"), "{message}");

    library.insert("lego_ocean", ShaderStage::Fragment, "   ");
    let err = ShaderSet::load(&backend, &library, "lego_ocean").err().unwrap();
    assert!(matches!(err, FatalError::ShaderCompile { ref name, .. } if name == "lego_ocean.frag.wgsl"));
}

#[test]
fn malformed_wgsl_is_rejected() {
    let backend = backend();
    let mut library = ShaderLibrary::builtin();
    let broken = ShaderLibrary::builtin()
        .load("lego_ocean", ShaderStage::Compute)
        .unwrap()
        .replacen("fn solid(i: u32) -> bool {", "fn solid(i: u32) -> bool", 1);
    library.insert("lego_ocean", ShaderStage::Compute, broken);

    let err = ShaderSet::load(&backend, &library, "lego_ocean").err().unwrap();
    assert!(matches!(err, FatalError::ShaderCompile { ref name, .. } if name == "lego_ocean.comp.wgsl"));

    // parses, but writes through a read-only binding
    let invalid = "@group(0) @binding(0) var<storage, read> data: array<f32>;\n\
                   @compute @workgroup_size(1) fn cs_main() { data[0] = 1.0; }";
    assert!(matches!(
        validate_wgsl("bad.comp.wgsl", ShaderStage::Compute, invalid),
        Err(FatalError::ShaderCompile { .. })
    ));
}

#[test]
fn shipped_shaders_match_the_pipeline_layouts() {
    let library = ShaderLibrary::builtin();
    let declared = |stage| {
        let source = library.load("lego_ocean", stage).unwrap();
        validate_wgsl(&ShaderLibrary::file_name("lego_ocean", stage), stage, &source).unwrap()
    };

    let compute = declared(ShaderStage::Compute);
    assert_eq!(compute, COMPUTE_LAYOUT.to_vec());
    assert_eq!(
        compute.iter().map(|e| e.kind).collect::<Vec<_>>(),
        [BindingKind::Uniform, BindingKind::StorageRead, BindingKind::StorageReadWrite]
    );

    assert_eq!(declared(ShaderStage::Vertex), DRAW_LAYOUT.to_vec());
    assert!(declared(ShaderStage::Fragment).is_empty());
}

#[test]
fn interface_mismatches_are_reported() {
    let read_only = [LayoutEntry {
        binding: 2,
        kind: BindingKind::StorageRead,
        visibility: StageFlags::COMPUTE,
    }];
    let err = check_interface("lego_ocean.comp.wgsl", &read_only, &COMPUTE_LAYOUT).unwrap_err();
    assert!(err.contains("binding 2"), "{err}");

    let extra = [LayoutEntry {
        binding: 3,
        kind: BindingKind::Uniform,
        visibility: StageFlags::COMPUTE,
    }];
    assert!(check_interface("lego_ocean.comp.wgsl", &extra, &COMPUTE_LAYOUT).is_err());

    let hidden = [LayoutEntry {
        binding: 0,
        kind: BindingKind::Uniform,
        visibility: StageFlags::FRAGMENT,
    }];
    assert!(check_interface("lego_ocean.frag.wgsl", &hidden, &DRAW_LAYOUT).is_err());
    assert_eq!(check_interface("lego_ocean.comp.wgsl", &COMPUTE_LAYOUT, &COMPUTE_LAYOUT), Ok(()));
}

#[test]
fn files_on_disk_override_builtin_sources() {
    let dir = scratch_dir("override");
    let custom = "// tinted\n@fragment fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }\n";
    std::fs::write(dir.join("lego_ocean.frag.wgsl"), custom).unwrap();

    let library = ShaderLibrary::builtin().with_root(&dir);
    assert_eq!(library.load("lego_ocean", ShaderStage::Fragment).unwrap(), custom);
    // stages without a file fall back to memory
    let vertex = library.load("lego_ocean", ShaderStage::Vertex).unwrap();
    assert!(vertex.contains("fn vs_main"));

    let from_dir = ShaderLibrary::from_dir(&dir);
    assert_eq!(from_dir.load("lego_ocean", ShaderStage::Fragment).unwrap(), custom);
    assert!(matches!(
        from_dir.load("lego_ocean", ShaderStage::Compute),
        Err(FatalError::ShaderNotFound(_))
    ));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn shipped_asset_directory_matches_builtin() {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets/shaders");
    let disk = ShaderLibrary::from_dir(root);
    let builtin = ShaderLibrary::builtin();
    for stage in ShaderStage::ALL {
        assert_eq!(
            disk.load("lego_ocean", stage).unwrap(),
            builtin.load("lego_ocean", stage).unwrap()
        );
    }
}
