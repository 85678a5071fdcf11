//! Reference-counted facet handles held by a session.
//!
//! Each acquisition increments the engine's count for that facet and each
//! release decrements it. The registry remembers every handle it acquired
//! so [`SubsystemRegistry::release_all`] can give all of them back.

use std::sync::Arc;

use log::{debug, warn};

use crate::engine::{
    BaseControl, CodecControl, EngineInstance, Facet, FacetHandle, FileControl, HardwareControl,
    MediaEngine, NetworkControl, ProcessingControl, VolumeControl,
};
use crate::error::VoeError;

/// Handles acquired from one engine instance.
///
/// A default registry is detached: every acquisition fails with
/// [`VoeError::UnavailableFacet`].
#[derive(Default)]
pub struct SubsystemRegistry {
    engine: Option<Arc<dyn MediaEngine>>,
    held: Vec<FacetHandle>,
}

macro_rules! typed_getter {
    ($name:ident, $variant:ident, $trait:ident) => {
        /// Held handle for this facet, acquiring one if none is held yet.
        pub fn $name(&mut self) -> Result<Arc<dyn $trait>, VoeError> {
            match self.held_or_acquire(Facet::$variant)? {
                FacetHandle::$variant(handle) => Ok(handle),
                _ => Err(VoeError::UnavailableFacet(Facet::$variant)),
            }
        }
    };
}

impl SubsystemRegistry {
    pub fn new(instance: &EngineInstance) -> Self {
        Self {
            engine: Some(instance.engine().clone()),
            held: Vec::new(),
        }
    }

    /// Acquire a new handle to `facet`.
    pub fn acquire(&mut self, facet: Facet) -> Result<FacetHandle, VoeError> {
        let engine = self
            .engine
            .as_ref()
            .ok_or(VoeError::UnavailableFacet(facet))?;

        let handle = engine
            .acquire(facet)
            .ok_or(VoeError::UnavailableFacet(facet))?;

        if handle.facet() != facet {
            // The engine counted the acquisition; give it back
            engine.release(facet);
            return Err(VoeError::UnavailableFacet(facet));
        }

        debug!("Acquired {} facet", facet);
        self.held.push(handle.clone());
        Ok(handle)
    }

    /// Acquire one handle to every facet, stopping at the first failure.
    pub fn acquire_all(&mut self) -> Result<(), VoeError> {
        for facet in Facet::ALL {
            self.acquire(facet)?;
        }
        Ok(())
    }

    /// Number of handles currently held for `facet`.
    pub fn held(&self, facet: Facet) -> usize {
        self.held.iter().filter(|h| h.facet() == facet).count()
    }

    pub fn held_total(&self) -> usize {
        self.held.len()
    }

    /// Release every held handle.
    ///
    /// Returns the sum over all releases of the references the engine
    /// still counts afterwards. Non-zero means someone else still holds a
    /// handle; it is logged, not treated as an error.
    pub fn release_all(&mut self) -> i32 {
        let Some(engine) = self.engine.as_ref() else {
            return 0;
        };

        let mut remaining = 0;
        for handle in self.held.drain(..) {
            let facet = handle.facet();
            drop(handle);
            remaining += engine.release(facet);
        }

        if remaining != 0 {
            warn!("{} facet references still held after release", remaining);
        } else {
            debug!("All facet handles released");
        }
        remaining
    }

    fn held_or_acquire(&mut self, facet: Facet) -> Result<FacetHandle, VoeError> {
        if let Some(handle) = self.held.iter().find(|h| h.facet() == facet) {
            return Ok(handle.clone());
        }
        self.acquire(facet)
    }

    typed_getter!(base, Base, BaseControl);
    typed_getter!(codec, Codec, CodecControl);
    typed_getter!(processing, Processing, ProcessingControl);
    typed_getter!(volume, Volume, VolumeControl);
    typed_getter!(network, Network, NetworkControl);
    typed_getter!(file, File, FileControl);
    typed_getter!(hardware, Hardware, HardwareControl);
}

impl Drop for SubsystemRegistry {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            warn!("Registry dropped with {} handles held; releasing", self.held.len());
            self.release_all();
        }
    }
}
