//! Typed process-environment overrides for the crucible runtime.
//!
//! Every tunable the attention dispatcher honors is declared here as a
//! [`TypedEnvVar`] so call sites never touch raw `std::env` strings. All
//! mutation goes through a single process-wide mutex, and tests use the
//! guard types to scope overrides and restore the previous state on drop.

use std::{
    marker::PhantomData,
    ops::Deref,
    sync::{Mutex, MutexGuard, OnceLock},
};

/// Environment variables understood by the crucible runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvVar {
    /// Override the simdgroup count baked into the attention kernel variant.
    FaWarps,
    /// Force a specific split-parallel degree, bypassing the occupancy heuristic.
    FaSplit,
    /// Disable split-parallel dispatch entirely (presence-only flag).
    DisableFaSplit,
    /// Accumulator precision override: `f16` or `f32`.
    AccumDtype,
    /// Directory to dump generated Metal source into, for diagnostics.
    DumpMetalSourceDir,
    /// Verbose dispatcher logging (presence-only flag).
    DebugFa,
}

impl EnvVar {
    /// Canonical environment variable key.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            EnvVar::FaWarps => "CRUCIBLE_FA_WARPS",
            EnvVar::FaSplit => "CRUCIBLE_FA_SPLIT",
            EnvVar::DisableFaSplit => "CRUCIBLE_DISABLE_FA_SPLIT",
            EnvVar::AccumDtype => "CRUCIBLE_ACCUM_DTYPE",
            EnvVar::DumpMetalSourceDir => "CRUCIBLE_DUMP_METAL_SOURCE_DIR",
            EnvVar::DebugFa => "CRUCIBLE_DEBUG_FA",
        }
    }
}

/// Process environment facade that centralises access and synchronisation.
pub struct Environment;

impl Environment {
    /// Acquire the global environment mutex, serialising mutations.
    pub fn lock() -> MutexGuard<'static, ()> {
        static ENV_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_MUTEX
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("environment mutex poisoned")
    }

    /// Read the variable as a UTF-8 string if present.
    pub fn get(var: EnvVar) -> Option<String> {
        std::env::var(var.key()).ok()
    }

    fn set_locked(var: EnvVar, value: &str, _guard: &mut MutexGuard<'static, ()>) {
        // SAFETY: the guard proves the caller holds the global environment
        // mutex, so no other thread mutates the process environment here.
        unsafe { std::env::set_var(var.key(), value) };
    }

    fn remove_locked(var: EnvVar, _guard: &mut MutexGuard<'static, ()>) {
        // SAFETY: serialised by the held environment mutex, as above.
        unsafe { std::env::remove_var(var.key()) };
    }
}

/// Presence-only flag check.
#[must_use]
pub fn is_set(var: EnvVar) -> bool {
    Environment::get(var).is_some()
}

/// Guard that restores the previous raw environment state on drop.
pub struct EnvVarGuard {
    var: EnvVar,
    previous: Option<String>,
}

impl EnvVarGuard {
    /// Set the variable for the duration of the guard.
    pub fn set(var: EnvVar, value: &str) -> Self {
        let mut lock = Environment::lock();
        let previous = Environment::get(var);
        Environment::set_locked(var, value, &mut lock);
        Self { var, previous }
    }

    /// Unset the variable for the duration of the guard.
    pub fn unset(var: EnvVar) -> Self {
        let mut lock = Environment::lock();
        let previous = Environment::get(var);
        Environment::remove_locked(var, &mut lock);
        Self { var, previous }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        let mut lock = Environment::lock();
        match &self.previous {
            Some(previous) => Environment::set_locked(self.var, previous, &mut lock),
            None => Environment::remove_locked(self.var, &mut lock),
        }
    }
}

/// Error produced when a typed environment variable holds an invalid value.
#[derive(Debug, thiserror::Error)]
#[error("failed to parse environment variable {name} from '{value}': {message}")]
pub struct EnvVarError {
    /// Canonical environment variable name.
    pub name: &'static str,
    /// Raw value retrieved from the process environment.
    pub value: String,
    /// Parser diagnostic.
    pub message: String,
}

/// Callback used to parse an environment string into a concrete value.
pub type ParseFn<T> = fn(&str) -> Result<T, String>;

/// Descriptor for a strongly-typed environment variable.
#[derive(Clone, Copy)]
pub struct TypedEnvVar<T> {
    var: EnvVar,
    parse: ParseFn<T>,
    _marker: PhantomData<T>,
}

impl<T: ToString> TypedEnvVar<T> {
    /// Create a new typed descriptor using the provided parser.
    pub const fn new(var: EnvVar, parse: ParseFn<T>) -> Self {
        Self {
            var,
            parse,
            _marker: PhantomData,
        }
    }

    /// Canonical environment variable key.
    #[must_use]
    pub const fn key(&self) -> &'static str {
        self.var.key()
    }

    /// Read and parse the variable; `Ok(None)` when unset.
    pub fn get(&self) -> Result<Option<T>, EnvVarError> {
        match Environment::get(self.var) {
            Some(raw) => (self.parse)(&raw).map(Some).map_err(|message| EnvVarError {
                name: self.key(),
                value: raw,
                message,
            }),
            None => Ok(None),
        }
    }

    /// Set the variable for the lifetime of the returned guard.
    pub fn set_guard(&self, value: T) -> TypedEnvVarGuard<'_, T> {
        let formatted = value.to_string();
        let mut lock = Environment::lock();
        let previous = Environment::get(self.var);
        Environment::set_locked(self.var, &formatted, &mut lock);
        drop(lock);
        TypedEnvVarGuard {
            descriptor: self,
            previous,
            value: Some(value),
        }
    }

    /// Unset the variable for the lifetime of the returned guard.
    #[must_use]
    pub fn unset_guard(&self) -> EnvVarGuard {
        EnvVarGuard::unset(self.var)
    }
}

/// Guard that restores the previous state of a typed environment variable.
pub struct TypedEnvVarGuard<'a, T: ToString> {
    descriptor: &'a TypedEnvVar<T>,
    previous: Option<String>,
    value: Option<T>,
}

impl<T: ToString> Deref for TypedEnvVarGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value
            .as_ref()
            .expect("typed environment guard always holds a value")
    }
}

impl<T: ToString> Drop for TypedEnvVarGuard<'_, T> {
    fn drop(&mut self) {
        let mut lock = Environment::lock();
        match &self.previous {
            Some(previous) => Environment::set_locked(self.descriptor.var, previous, &mut lock),
            None => Environment::remove_locked(self.descriptor.var, &mut lock),
        }
    }
}

fn parse_u32(value: &str) -> Result<u32, String> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| "value is not a valid u32".to_string())
}

fn parse_string(value: &str) -> Result<String, String> {
    Ok(value.to_string())
}

/// Typed descriptor for CRUCIBLE_FA_WARPS.
pub const FA_WARPS: TypedEnvVar<u32> = TypedEnvVar::new(EnvVar::FaWarps, parse_u32);
/// Typed descriptor for CRUCIBLE_FA_SPLIT.
pub const FA_SPLIT: TypedEnvVar<u32> = TypedEnvVar::new(EnvVar::FaSplit, parse_u32);
/// Typed descriptor for CRUCIBLE_ACCUM_DTYPE.
pub const ACCUM_DTYPE: TypedEnvVar<String> = TypedEnvVar::new(EnvVar::AccumDtype, parse_string);
/// Typed descriptor for CRUCIBLE_DUMP_METAL_SOURCE_DIR.
pub const DUMP_METAL_SOURCE_DIR: TypedEnvVar<String> =
    TypedEnvVar::new(EnvVar::DumpMetalSourceDir, parse_string);
