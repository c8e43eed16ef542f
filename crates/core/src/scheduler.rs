//! Residency tracking for local models. Remote providers are accepted
//! everywhere and never tracked; local ones are admitted against a RAM budget
//! and a concurrency cap, and evicted least-recently-used first.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use foldwise_llm::{BackendKind, ProviderDescriptor};
use parking_lot::{Condvar, Mutex};
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::SchedulerSettings;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("model {0} is not registered with the scheduler")]
    UnknownModel(String),
    #[error("model {name} needs {required_gb:.1} GB but only {total_gb:.1} GB exist")]
    ExceedsTotalRam {
        name: String,
        required_gb: f64,
        total_gb: f64,
    },
    #[error("cannot load {name}: {reason}")]
    Blocked { name: String, reason: String },
    #[error("cannot load {name} until a running call releases its model")]
    Busy { name: String },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub total_ram_gb: f64,
    pub max_concurrent: usize,
    pub idle_timeout: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        let total_ram_gb = settings.total_ram_gb.unwrap_or_else(detect_total_ram_gb);
        Self {
            total_ram_gb,
            max_concurrent: settings.max_concurrent,
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
        }
    }
}

/// Physical memory of this host in GB.
pub fn detect_total_ram_gb() -> f64 {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory() as f64 / BYTES_PER_GB;
    debug!(total_gb = total, "detected host memory");
    total
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub name: String,
    pub backend: BackendKind,
    pub ram_gb: f64,
    pub loaded_at: Instant,
    pub last_used_at: Instant,
    /// Calls currently generating with this model. Leased models are never
    /// evicted.
    pub in_flight: usize,
}

pub type EvictionHook = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct State {
    known: BTreeMap<String, ProviderDescriptor>,
    loaded: BTreeMap<String, LoadedModel>,
}

impl State {
    fn used_ram_gb(&self) -> f64 {
        self.loaded.values().map(|m| m.ram_gb).sum()
    }

    /// Unleased models, least recently used first.
    fn idle_by_age(&self) -> Vec<&LoadedModel> {
        let mut idle: Vec<&LoadedModel> = self.loaded.values().filter(|m| m.in_flight == 0).collect();
        idle.sort_by_key(|m| m.last_used_at);
        idle
    }
}

pub struct ModelScheduler {
    config: SchedulerConfig,
    state: Mutex<State>,
    released: Condvar,
    on_evict: Option<EvictionHook>,
}

impl ModelScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            released: Condvar::new(),
            on_evict: None,
        }
    }

    /// Called with the model name after every eviction, outside the lock.
    pub fn with_eviction_hook(mut self, hook: EvictionHook) -> Self {
        self.on_evict = Some(hook);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn register(&self, descriptor: &ProviderDescriptor) {
        self.state
            .lock()
            .known
            .insert(descriptor.name.clone(), descriptor.clone());
    }

    pub fn can_load(&self, name: &str) -> (bool, String) {
        let state = self.state.lock();
        self.check(&state, name)
    }

    fn check(&self, state: &State, name: &str) -> (bool, String) {
        let Some(desc) = state.known.get(name) else {
            return (false, format!("unknown model {name}"));
        };
        if !desc.is_local() {
            return (true, "remote provider".to_string());
        }
        if state.loaded.contains_key(name) {
            return (true, "already loaded".to_string());
        }
        let available = self.config.total_ram_gb - state.used_ram_gb();
        if desc.ram_required_gb > available {
            return (
                false,
                format!(
                    "needs {:.1} GB, {:.1} GB available",
                    desc.ram_required_gb, available
                ),
            );
        }
        if state.loaded.len() >= self.config.max_concurrent {
            return (
                false,
                format!(
                    "{} of {} local model slots in use",
                    state.loaded.len(),
                    self.config.max_concurrent
                ),
            );
        }
        (true, "fits".to_string())
    }

    /// Makes `name` resident. With `force`, evicts the least recently used
    /// idle local models until it fits, waiting for running calls to finish
    /// when every candidate is leased. Returns the names evicted.
    pub fn load(&self, name: &str, force: bool) -> Result<Vec<String>, SchedulerError> {
        self.load_at(name, force, Instant::now())
    }

    pub fn load_at(
        &self,
        name: &str,
        force: bool,
        now: Instant,
    ) -> Result<Vec<String>, SchedulerError> {
        self.admit_waiting(name, force, now, false)
    }

    /// Loads `name` like [`load`](Self::load) and holds it resident until the
    /// returned lease is dropped.
    pub fn acquire(&self, name: &str, force: bool) -> Result<ModelLease<'_>, SchedulerError> {
        self.admit_waiting(name, force, Instant::now(), true)?;
        Ok(ModelLease {
            scheduler: self,
            name: name.to_string(),
        })
    }

    fn admit_waiting(
        &self,
        name: &str,
        force: bool,
        now: Instant,
        lease: bool,
    ) -> Result<Vec<String>, SchedulerError> {
        let mut evicted = self.reap_locked(now);
        let outcome = {
            let mut state = self.state.lock();
            let admitted = loop {
                let at = now.max(Instant::now());
                match self.admit(&mut state, name, force, at, &mut evicted) {
                    Err(SchedulerError::Busy { .. }) => {
                        debug!(model = name, "waiting for a running call to release a model");
                        self.released.wait(&mut state);
                    }
                    other => break other,
                }
            };
            if lease && admitted.is_ok() {
                if let Some(model) = state.loaded.get_mut(name) {
                    model.in_flight += 1;
                }
            }
            admitted
        };
        self.notify(&evicted);
        outcome.map(|()| evicted)
    }

    /// Admits `name` or changes nothing. Victims are only chosen among idle
    /// models; `Busy` means a forced load must wait for a lease to end.
    fn admit(
        &self,
        state: &mut State,
        name: &str,
        force: bool,
        now: Instant,
        evicted: &mut Vec<String>,
    ) -> Result<(), SchedulerError> {
        let desc = state
            .known
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownModel(name.to_string()))?;
        if !desc.is_local() {
            return Ok(());
        }
        if let Some(model) = state.loaded.get_mut(name) {
            model.last_used_at = now;
            return Ok(());
        }
        if desc.ram_required_gb > self.config.total_ram_gb {
            return Err(SchedulerError::ExceedsTotalRam {
                name: name.to_string(),
                required_gb: desc.ram_required_gb,
                total_gb: self.config.total_ram_gb,
            });
        }
        let (fits, reason) = self.check(state, name);
        if !fits && !force {
            return Err(SchedulerError::Blocked {
                name: name.to_string(),
                reason,
            });
        }

        let victims = self.pick_victims(state, name, desc.ram_required_gb, reason)?;
        for victim in victims {
            state.loaded.remove(&victim);
            info!(model = %victim, for_model = name, "evicted to make room");
            evicted.push(victim);
        }
        state.loaded.insert(
            name.to_string(),
            LoadedModel {
                name: name.to_string(),
                backend: desc.backend,
                ram_gb: desc.ram_required_gb,
                loaded_at: now,
                last_used_at: now,
                in_flight: 0,
            },
        );
        debug!(
            model = name,
            ram_gb = desc.ram_required_gb,
            used_gb = state.used_ram_gb(),
            "model loaded"
        );
        Ok(())
    }

    /// Oldest idle models whose eviction makes room for `ram_gb`.
    fn pick_victims(
        &self,
        state: &State,
        name: &str,
        ram_gb: f64,
        reason: String,
    ) -> Result<Vec<String>, SchedulerError> {
        let mut used = state.used_ram_gb();
        let mut count = state.loaded.len();
        let mut victims = Vec::new();
        let mut idle = state.idle_by_age().into_iter();
        while used + ram_gb > self.config.total_ram_gb || count >= self.config.max_concurrent {
            match idle.next() {
                Some(model) => {
                    used -= model.ram_gb;
                    count -= 1;
                    victims.push(model.name.clone());
                }
                None if state.loaded.values().any(|m| m.in_flight > 0) => {
                    return Err(SchedulerError::Busy {
                        name: name.to_string(),
                    });
                }
                None => {
                    return Err(SchedulerError::Blocked {
                        name: name.to_string(),
                        reason,
                    });
                }
            }
        }
        Ok(victims)
    }

    fn release(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(model) = state.loaded.get_mut(name) {
            model.in_flight = model.in_flight.saturating_sub(1);
            model.last_used_at = Instant::now();
        }
        drop(state);
        self.released.notify_all();
    }

    /// Drops tracking state; no-op for remote or unloaded models.
    pub fn unload(&self, name: &str) -> bool {
        let removed = self.state.lock().loaded.remove(name).is_some();
        if removed {
            self.notify(&[name.to_string()]);
        }
        removed
    }

    pub fn touch(&self, name: &str) {
        self.touch_at(name, Instant::now());
    }

    pub fn touch_at(&self, name: &str, now: Instant) {
        if let Some(model) = self.state.lock().loaded.get_mut(name) {
            model.last_used_at = now;
        }
    }

    /// Evicts every local model idle for longer than the configured timeout.
    pub fn reap_idle(&self) -> Vec<String> {
        self.reap_idle_at(Instant::now())
    }

    pub fn reap_idle_at(&self, now: Instant) -> Vec<String> {
        let evicted = self.reap_locked(now);
        self.notify(&evicted);
        evicted
    }

    fn reap_locked(&self, now: Instant) -> Vec<String> {
        let mut state = self.state.lock();
        let idle: Vec<String> = state
            .loaded
            .values()
            .filter(|m| m.in_flight == 0)
            .filter(|m| now.saturating_duration_since(m.last_used_at) > self.config.idle_timeout)
            .map(|m| m.name.clone())
            .collect();
        for name in &idle {
            state.loaded.remove(name);
            info!(model = %name, "evicted idle model");
        }
        idle
    }

    fn notify(&self, evicted: &[String]) {
        let Some(hook) = &self.on_evict else {
            return;
        };
        for name in evicted {
            hook(name);
        }
    }

    pub fn loaded(&self) -> Vec<LoadedModel> {
        self.state.lock().loaded.values().cloned().collect()
    }

    pub fn used_ram_gb(&self) -> f64 {
        self.state.lock().used_ram_gb()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.state.lock().loaded.contains_key(name)
    }

    pub fn in_flight(&self, name: &str) -> usize {
        self.state.lock().loaded.get(name).map_or(0, |m| m.in_flight)
    }
}

/// Keeps a model resident while a call is generating with it.
pub struct ModelLease<'a> {
    scheduler: &'a ModelScheduler,
    name: String,
}

impl ModelLease<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ModelLease<'_> {
    fn drop(&mut self) {
        self.scheduler.release(&self.name);
    }
}

impl Drop for ModelScheduler {
    fn drop(&mut self) {
        let names: Vec<String> = self.state.get_mut().loaded.keys().cloned().collect();
        if !names.is_empty() {
            info!(count = names.len(), "releasing resident models on shutdown");
            self.state.get_mut().loaded.clear();
            self.notify(&names);
        }
    }
}
