// shader loading collaborator: named shader -> vertex/fragment/compute modules
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use bevy::log::debug;
use naga::valid::{Capabilities, ValidationFlags, Validator};

use crate::gpu::backend::{Backend, BindingKind, LayoutEntry, ShaderStage, StageFlags};
use crate::gpu::error::FatalError;

const BUILTIN: [(&str, &str); 3] = [
    (
        "lego_ocean.vert.wgsl",
        include_str!("../../assets/shaders/lego_ocean.vert.wgsl"),
    ),
    (
        "lego_ocean.frag.wgsl",
        include_str!("../../assets/shaders/lego_ocean.frag.wgsl"),
    ),
    (
        "lego_ocean.comp.wgsl",
        include_str!("../../assets/shaders/lego_ocean.comp.wgsl"),
    ),
];

#[derive(Clone, Debug, Default)]
pub struct ShaderLibrary {
    root: Option<PathBuf>,
    sources: HashMap<String, String>,
}

impl ShaderLibrary {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The shaders compiled into the crate.
    pub fn builtin() -> Self {
        let mut library = Self::empty();
        for (file, source) in BUILTIN {
            library.sources.insert(file.to_string(), source.to_string());
        }
        library
    }

    /// Files under `root` take precedence over in-memory sources.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self::empty().with_root(root)
    }

    pub fn file_name(name: &str, stage: ShaderStage) -> String {
        format!("{name}.{}.wgsl", stage.extension())
    }

    pub fn insert(&mut self, name: &str, stage: ShaderStage, source: impl Into<String>) {
        self.sources.insert(Self::file_name(name, stage), source.into());
    }

    pub fn load(&self, name: &str, stage: ShaderStage) -> Result<String, FatalError> {
        let file = Self::file_name(name, stage);

        if let Some(root) = &self.root {
            let path = root.join(&file);
            match std::fs::read_to_string(&path) {
                Ok(source) => {
                    debug!("pipeline: loaded {}", path.display());
                    return Ok(source);
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(FatalError::ShaderNotFound(format!("{}: {err}", path.display())));
                }
            }
        }

        self.sources
            .get(&file)
            .cloned()
            .ok_or(FatalError::ShaderNotFound(file))
    }
}

/// Compiled modules for one named shader. Immutable once built.
pub struct ShaderSet<B: Backend> {
    pub vertex: B::ShaderModule,
    pub fragment: B::ShaderModule,
    pub compute: B::ShaderModule,
}

impl<B: Backend> ShaderSet<B> {
    pub fn load(backend: &B, library: &ShaderLibrary, name: &str) -> Result<Self, FatalError> {
        let compile = |stage: ShaderStage| -> Result<B::ShaderModule, FatalError> {
            let source = library.load(name, stage)?;
            backend.compile_shader(&ShaderLibrary::file_name(name, stage), stage, &source)
        };
        Ok(Self {
            vertex: compile(ShaderStage::Vertex)?,
            fragment: compile(ShaderStage::Fragment)?,
            compute: compile(ShaderStage::Compute)?,
        })
    }
}

fn naga_stage(stage: ShaderStage) -> naga::ShaderStage {
    match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
        ShaderStage::Compute => naga::ShaderStage::Compute,
    }
}

fn stage_flags(stage: ShaderStage) -> StageFlags {
    match stage {
        ShaderStage::Vertex => StageFlags::VERTEX,
        ShaderStage::Fragment => StageFlags::FRAGMENT,
        ShaderStage::Compute => StageFlags::COMPUTE,
    }
}

/// Parses and validates a WGSL module with naga, then returns the group 0
/// buffer bindings it declares, sorted by binding index.
pub fn validate_wgsl(name: &str, stage: ShaderStage, source: &str) -> Result<Vec<LayoutEntry>, FatalError> {
    let compile_error = |message: String| FatalError::ShaderCompile {
        name: name.to_string(),
        message,
    };
    if source.trim().is_empty() {
        return Err(compile_error("empty source".to_string()));
    }

    let module = naga::front::wgsl::parse_str(source).map_err(|err| compile_error(err.emit_to_string(source)))?;
    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|err| compile_error(err.to_string()))?;

    let entry = stage.entry_point();
    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry && ep.stage == naga_stage(stage))
    {
        return Err(compile_error(format!("missing entry point `{entry}`")));
    }

    let visibility = stage_flags(stage);
    let mut bindings: Vec<LayoutEntry> = module
        .global_variables
        .iter()
        .filter_map(|(_, var)| {
            let binding = var.binding.as_ref().filter(|b| b.group == 0)?;
            let kind = match var.space {
                naga::AddressSpace::Uniform => BindingKind::Uniform,
                naga::AddressSpace::Storage { access } if access.contains(naga::StorageAccess::STORE) => {
                    BindingKind::StorageReadWrite
                }
                naga::AddressSpace::Storage { .. } => BindingKind::StorageRead,
                _ => return None,
            };
            Some(LayoutEntry {
                binding: binding.binding,
                kind,
                visibility,
            })
        })
        .collect();
    bindings.sort_by_key(|entry| entry.binding);
    Ok(bindings)
}

/// Checks every binding a module declares against a pipeline layout.
pub fn check_interface(
    shader: &str,
    declared: &[LayoutEntry],
    layout: &[LayoutEntry],
) -> Result<(), String> {
    for wanted in declared {
        let Some(slot) = layout.iter().find(|slot| slot.binding == wanted.binding) else {
            return Err(format!("`{shader}` binding {} is missing from the layout", wanted.binding));
        };
        if slot.kind != wanted.kind {
            return Err(format!(
                "`{shader}` binding {} is {:?} but the layout has {:?}",
                wanted.binding, wanted.kind, slot.kind
            ));
        }
        if !slot.visibility.contains(wanted.visibility) {
            return Err(format!("`{shader}` binding {} is not visible to its stage", wanted.binding));
        }
    }
    Ok(())
}
