//! Static module registry.
//!
//! Module names map to typed constructors in [`MODULES`]. A configuration
//! is turned into live instances by [`build_modules`], which fails on the
//! first instance that cannot be created.

use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use tracing::info;

use crate::{
    delivery::{Globals, Storage, StorageConfig},
    dkim::{DkimConfig, DkimModifier},
    Config, DeliveryTarget, Error, Modifier, ModuleConfig, Result,
};

/// Capability a module provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Modifier,
    DeliveryTarget,
}

impl Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleKind::Modifier => write!(f, "modifier"),
            ModuleKind::DeliveryTarget => write!(f, "delivery target"),
        }
    }
}

/// A constructed module instance.
pub enum Module {
    Modifier(Arc<dyn Modifier>),
    DeliveryTarget(Arc<dyn DeliveryTarget>),
}

impl Module {
    pub fn kind(&self) -> ModuleKind {
        match self {
            Module::Modifier(_) => ModuleKind::Modifier,
            Module::DeliveryTarget(_) => ModuleKind::DeliveryTarget,
        }
    }
}

/// Builds one instance from its name, configuration and the globals.
pub type Constructor = fn(&str, &ModuleConfig, &Globals) -> Result<Module>;

/// Registered modules.
pub const MODULES: &[(&str, ModuleKind, Constructor)] = &[
    ("sign_dkim", ModuleKind::Modifier, new_sign_dkim),
    ("sql", ModuleKind::DeliveryTarget, new_sql),
];

fn new_sign_dkim(instance_name: &str, config: &ModuleConfig, globals: &Globals) -> Result<Module> {
    let mut options: DkimConfig = config.options_as(instance_name)?;
    let template = std::path::Path::new(&options.key_path);
    if template.is_relative() {
        options.key_path = globals
            .state_dir
            .join(template)
            .to_string_lossy()
            .into_owned();
    }
    let modifier = DkimModifier::new(instance_name, &config.args, options)?;
    Ok(Module::Modifier(Arc::new(modifier)))
}

fn new_sql(instance_name: &str, config: &ModuleConfig, globals: &Globals) -> Result<Module> {
    let options: StorageConfig = config.options_as(instance_name)?;
    let storage = Storage::new(instance_name, &config.args, options, globals)?;
    Ok(Module::DeliveryTarget(Arc::new(storage)))
}

/// Looks a module up by name.
pub fn lookup(name: &str) -> Option<(ModuleKind, Constructor)> {
    MODULES
        .iter()
        .find(|(registered, _, _)| *registered == name)
        .map(|(_, kind, constructor)| (*kind, *constructor))
}

/// Creates one module instance.
pub fn build_module(instance_name: &str, config: &ModuleConfig, globals: &Globals) -> Result<Module> {
    let Some((_, constructor)) = lookup(&config.kind) else {
        return Err(Error::configuration(format!(
            "{instance_name}: unknown module {}",
            config.kind
        )));
    };
    constructor(instance_name, config, globals)
}

/// Module instances created from a configuration, by instance name.
#[derive(Default)]
pub struct Modules {
    pub modifiers: BTreeMap<String, Arc<dyn Modifier>>,
    pub targets: BTreeMap<String, Arc<dyn DeliveryTarget>>,
}

impl Modules {
    pub fn modifier(&self, instance_name: &str) -> Option<&Arc<dyn Modifier>> {
        self.modifiers.get(instance_name)
    }

    pub fn target(&self, instance_name: &str) -> Option<&Arc<dyn DeliveryTarget>> {
        self.targets.get(instance_name)
    }
}

/// Creates every module instance of `config`.
pub fn build_modules(config: &Config) -> Result<Modules> {
    let globals = Globals {
        state_dir: config.state_dir.clone(),
        hostname: config.hostname.clone(),
    };
    let mut modules = Modules::default();
    for (instance_name, module_config) in &config.modules {
        let module = build_module(instance_name, module_config, &globals)?;
        info!(
            instance = %instance_name,
            module = %module_config.kind,
            kind = %module.kind(),
            "Module instance created"
        );
        match module {
            Module::Modifier(modifier) => {
                modules.modifiers.insert(instance_name.clone(), modifier);
            }
            Module::DeliveryTarget(target) => {
                modules.targets.insert(instance_name.clone(), target);
            }
        }
    }
    Ok(modules)
}
