//! The capability table: every polymorphic collaborator the engine
//! dispatches into, registered by name or keyword.
//!
//! Embedders start from [`Registry::with_defaults`] and add their provider
//! plugins on top. Requisite plugins are ordered: registration order is
//! execution order for the checks on one chunk.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::esm::local::LocalBackend;
use crate::esm::{EsmBackend, EsmUpgrade};
use crate::exec::requisites::{ArgBindPlugin, RecreateOnUpdatePlugin, RequirePlugin, RequisitePlugin};
use crate::render::blocks::{ParamsCheck, Render, RenderCheck, YamlRenderer};
use crate::render::resolve::{IncludeResolve, ParamsResolve, Resolve};
use crate::resource::{ResourcePlugin, TestResource};

#[derive(Default)]
pub struct Registry {
  resources: HashMap<String, Arc<dyn ResourcePlugin>>,
  requisites: Vec<Arc<dyn RequisitePlugin>>,
  renderers: HashMap<String, Arc<dyn Render>>,
  render_checks: HashMap<String, Arc<dyn RenderCheck>>,
  resolvers: Vec<Arc<dyn Resolve>>,
  esm_backends: HashMap<String, Arc<dyn EsmBackend>>,
  esm_upgrades: Vec<Arc<dyn EsmUpgrade>>,
}

impl Registry {
  /// An empty table. Most callers want [`Registry::with_defaults`].
  pub fn new() -> Self {
    Self::default()
  }

  /// The built-in capability set: YAML rendering, the include/params resolve
  /// chain, the three requisite keywords, the local ESM backend and the
  /// `test` resource.
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register_renderer(Arc::new(YamlRenderer));
    registry.register_render_check(Arc::new(ParamsCheck));
    registry.register_resolver(Arc::new(IncludeResolve));
    registry.register_resolver(Arc::new(ParamsResolve));
    registry.register_requisite(Arc::new(RequirePlugin));
    registry.register_requisite(Arc::new(ArgBindPlugin));
    registry.register_requisite(Arc::new(RecreateOnUpdatePlugin));
    registry.register_esm_backend(Arc::new(LocalBackend));
    registry.register_resource(Arc::new(TestResource));
    registry
  }

  pub fn register_resource(&mut self, plugin: Arc<dyn ResourcePlugin>) {
    debug!(resource = plugin.resource_type(), "registered resource plugin");
    self.resources.insert(plugin.resource_type().to_string(), plugin);
  }

  pub fn register_requisite(&mut self, plugin: Arc<dyn RequisitePlugin>) {
    self.requisites.retain(|p| p.keyword() != plugin.keyword());
    self.requisites.push(plugin);
  }

  pub fn register_renderer(&mut self, renderer: Arc<dyn Render>) {
    self.renderers.insert(renderer.name().to_string(), renderer);
  }

  pub fn register_render_check(&mut self, check: Arc<dyn RenderCheck>) {
    self.render_checks.insert(check.keyword().to_string(), check);
  }

  pub fn register_resolver(&mut self, resolver: Arc<dyn Resolve>) {
    self.resolvers.push(resolver);
  }

  pub fn register_esm_backend(&mut self, backend: Arc<dyn EsmBackend>) {
    self.esm_backends.insert(backend.name().to_string(), backend);
  }

  pub fn register_esm_upgrade(&mut self, upgrade: Arc<dyn EsmUpgrade>) {
    self.esm_upgrades.push(upgrade);
  }

  pub fn resource(&self, resource_type: &str) -> Option<Arc<dyn ResourcePlugin>> {
    self.resources.get(resource_type).cloned()
  }

  pub fn resource_types(&self) -> Vec<&str> {
    let mut types: Vec<&str> = self.resources.keys().map(String::as_str).collect();
    types.sort_unstable();
    types
  }

  /// Requisite plugins in registration (execution) order.
  pub fn requisites(&self) -> &[Arc<dyn RequisitePlugin>] {
    &self.requisites
  }

  pub fn has_requisite(&self, keyword: &str) -> bool {
    self.requisites.iter().any(|p| p.keyword() == keyword)
  }

  pub fn renderer(&self, name: &str) -> Option<Arc<dyn Render>> {
    self.renderers.get(name).cloned()
  }

  pub fn render_check(&self, keyword: &str) -> Option<Arc<dyn RenderCheck>> {
    self.render_checks.get(keyword).cloned()
  }

  pub fn resolvers(&self) -> &[Arc<dyn Resolve>] {
    &self.resolvers
  }

  pub fn esm_backend(&self, name: &str) -> Option<Arc<dyn EsmBackend>> {
    self.esm_backends.get(name).cloned()
  }

  pub fn esm_upgrades(&self) -> &[Arc<dyn EsmUpgrade>] {
    &self.esm_upgrades
  }
}
