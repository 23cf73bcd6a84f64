// SPDX-License-Identifier: MPL-2.0

//! Imported GPU images, keyed by decoder surface.
//!
//! Decoders recycle a small pool of surfaces, so importing each one once and
//! reusing the image saves a driver round trip per frame. Entries are keyed
//! by `(identity, generation)`; a seek or a decoder reset bumps the
//! generation and every older entry becomes unreachable.

use drm_fourcc::DrmModifier;

use crate::dmabuf::{DmaBufFormat, DmaBufPlane, fourcc_name, normalize_modifier};
use crate::frame::{ColorMatrix, ColorRange, GpuSurface};

pub const CACHE_CAPACITY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("zero-copy import is known not to work on this display")]
    Unsupported,
    #[error("modifier {0:#018x} needs EGL_EXT_image_dma_buf_import_modifiers")]
    UnsupportedModifier(u64),
    #[error("{0} planes can't be described without modifier support")]
    TooManyPlanes(usize),
    #[error("eglCreateImageKHR failed with {0:#06x}")]
    Egl(i32),
}

/// What the importer needs to build an image.
pub struct ImportRequest<'a> {
    pub width: u32,
    pub height: u32,
    pub format: DmaBufFormat,
    pub planes: &'a [DmaBufPlane],
    pub matrix: ColorMatrix,
    pub range: ColorRange,
}

impl<'a> ImportRequest<'a> {
    pub fn new(
        surface: &'a GpuSurface,
        width: u32,
        height: u32,
        matrix: ColorMatrix,
        range: ColorRange,
    ) -> Self {
        Self {
            width,
            height,
            format: surface.format,
            planes: &surface.planes,
            matrix,
            range,
        }
    }
}

/// Turns dmabuf planes into something the GPU can sample.
pub trait ImageImporter {
    type Image: Copy;

    fn supports_modifiers(&self) -> bool;

    fn import(&mut self, request: &ImportRequest<'_>) -> Result<Self::Image, ImportError>;

    fn destroy(&mut self, image: Self::Image);
}

/// Whether zero-copy import has been shown to work.
///
/// Only the first outcome counts, a later failure on a display that already
/// imported something is treated as a one-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImportStatus {
    #[default]
    Untested,
    Works,
    Broken,
}

struct Entry<T> {
    identity: u64,
    generation: u64,
    image: T,
    last_use: u64,
}

pub struct ImageCache<I: ImageImporter> {
    importer: I,
    slots: [Option<Entry<I::Image>>; CACHE_CAPACITY],
    clock: u64,
    status: ImportStatus,
    imports: u64,
}

impl<I: ImageImporter> ImageCache<I> {
    pub fn new(importer: I) -> Self {
        Self {
            importer,
            slots: std::array::from_fn(|_| None),
            clock: 0,
            status: ImportStatus::Untested,
            imports: 0,
        }
    }

    pub fn status(&self) -> ImportStatus {
        self.status
    }

    /// Images created over the cache's lifetime.
    pub fn imports(&self) -> u64 {
        self.imports
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached image for the surface or import a new one.
    pub fn get_or_import(
        &mut self,
        identity: u64,
        generation: u64,
        request: &ImportRequest<'_>,
    ) -> Result<I::Image, ImportError> {
        if self.status == ImportStatus::Broken {
            return Err(ImportError::Unsupported);
        }

        self.clock += 1;
        let clock = self.clock;

        if let Some(entry) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|entry| entry.identity == identity && entry.generation == generation)
        {
            entry.last_use = clock;
            return Ok(entry.image);
        }

        if !self.importer.supports_modifiers() {
            let linear = u64::from(DrmModifier::Linear);
            if let Some(plane) = request
                .planes
                .iter()
                .find(|plane| normalize_modifier(plane.modifier) != linear)
            {
                self.record(request, false);
                return Err(ImportError::UnsupportedModifier(plane.modifier));
            }
        }

        let image = match self.importer.import(request) {
            Ok(image) => image,
            Err(why) => {
                self.record(request, false);
                return Err(why);
            }
        };
        self.record(request, true);
        self.imports += 1;

        let index = self.victim(identity);
        if let Some(old) = self.slots[index].take() {
            self.importer.destroy(old.image);
        }
        self.slots[index] = Some(Entry {
            identity,
            generation,
            image,
            last_use: clock,
        });

        Ok(image)
    }

    /// Destroy every image. The import status survives.
    pub fn clear(&mut self) {
        for entry in self.slots.iter_mut().filter_map(Option::take) {
            self.importer.destroy(entry.image);
        }
    }

    fn record(&mut self, request: &ImportRequest<'_>, works: bool) {
        if self.status != ImportStatus::Untested {
            return;
        }
        let format = fourcc_name(request.format.fourcc);
        let modifier = request.format.modifier;
        self.status = if works {
            tracing::info!(%format, modifier, "Zero-copy import works");
            ImportStatus::Works
        } else {
            tracing::warn!(%format, modifier, "Zero-copy import failed, using texture upload");
            ImportStatus::Broken
        };
    }

    /// Slot for a new entry: the surface's stale entry, a free slot, or the
    /// least recently used one.
    fn victim(&self, identity: u64) -> usize {
        let stale = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|entry| entry.identity == identity));
        let free = || self.slots.iter().position(Option::is_none);
        let oldest = || {
            self.slots
                .iter()
                .enumerate()
                .min_by_key(|(_, slot)| slot.as_ref().map_or(0, |entry| entry.last_use))
                .map_or(0, |(index, _)| index)
        };

        stale.or_else(free).unwrap_or_else(oldest)
    }
}

impl<I: ImageImporter> Drop for ImageCache<I> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmabuf::DmaBufPlane;
    use drm_fourcc::DrmFourcc;
    use std::cell::RefCell;
    use std::os::fd::OwnedFd;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        imported: Vec<u32>,
        destroyed: Vec<u32>,
    }

    struct FakeImporter {
        log: Rc<RefCell<Log>>,
        next: u32,
        modifiers: bool,
        fail: bool,
    }

    impl FakeImporter {
        fn new(log: &Rc<RefCell<Log>>) -> Self {
            Self {
                log: Rc::clone(log),
                next: 0,
                modifiers: true,
                fail: false,
            }
        }
    }

    impl ImageImporter for FakeImporter {
        type Image = u32;

        fn supports_modifiers(&self) -> bool {
            self.modifiers
        }

        fn import(&mut self, _: &ImportRequest<'_>) -> Result<u32, ImportError> {
            if self.fail {
                return Err(ImportError::Egl(0x3003));
            }
            self.next += 1;
            self.log.borrow_mut().imported.push(self.next);
            Ok(self.next)
        }

        fn destroy(&mut self, image: u32) {
            self.log.borrow_mut().destroyed.push(image);
        }
    }

    fn plane(modifier: u64) -> DmaBufPlane {
        DmaBufPlane {
            fd: OwnedFd::from(std::fs::File::open("/dev/null").unwrap()),
            offset: 0,
            stride: 1920,
            modifier,
        }
    }

    fn request(planes: &[DmaBufPlane]) -> ImportRequest<'_> {
        ImportRequest {
            width: 1920,
            height: 1080,
            format: DmaBufFormat::linear(DrmFourcc::Nv12),
            planes,
            matrix: ColorMatrix::Bt709,
            range: ColorRange::Limited,
        }
    }

    #[test]
    fn test_hit_does_not_reimport() {
        let log = Rc::default();
        let mut cache = ImageCache::new(FakeImporter::new(&log));
        let planes = [plane(0)];

        let first = cache.get_or_import(7, 0, &request(&planes)).unwrap();
        let again = cache.get_or_import(7, 0, &request(&planes)).unwrap();

        assert_eq!(first, again);
        assert_eq!(log.borrow().imported.len(), 1);
        assert_eq!(cache.status(), ImportStatus::Works);
    }

    #[test]
    fn test_new_generation_replaces_entry() {
        let log = Rc::default();
        let mut cache = ImageCache::new(FakeImporter::new(&log));
        let planes = [plane(0)];

        let old = cache.get_or_import(7, 0, &request(&planes)).unwrap();
        let new = cache.get_or_import(7, 1, &request(&planes)).unwrap();

        assert_ne!(old, new);
        assert_eq!(cache.len(), 1);
        assert_eq!(log.borrow().destroyed, vec![old]);
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let log = Rc::default();
        let mut cache = ImageCache::new(FakeImporter::new(&log));
        let planes = [plane(0)];

        for identity in 0..CACHE_CAPACITY as u64 {
            cache.get_or_import(identity, 0, &request(&planes)).unwrap();
        }
        // touch 0 so 1 becomes the oldest
        cache.get_or_import(0, 0, &request(&planes)).unwrap();
        cache.get_or_import(100, 0, &request(&planes)).unwrap();

        assert_eq!(cache.len(), CACHE_CAPACITY);
        // image ids start at 1, identity 1 got image 2
        assert_eq!(log.borrow().destroyed, vec![2]);
    }

    #[test]
    fn test_first_failure_disables_import() {
        let log = Rc::default();
        let mut importer = FakeImporter::new(&log);
        importer.fail = true;
        let mut cache = ImageCache::new(importer);
        let planes = [plane(0)];

        assert!(matches!(
            cache.get_or_import(1, 0, &request(&planes)),
            Err(ImportError::Egl(_))
        ));
        assert_eq!(cache.status(), ImportStatus::Broken);

        cache.importer.fail = false;
        assert!(matches!(
            cache.get_or_import(1, 0, &request(&planes)),
            Err(ImportError::Unsupported)
        ));
        assert!(log.borrow().imported.is_empty());
    }

    #[test]
    fn test_later_failure_keeps_status() {
        let log = Rc::default();
        let mut cache = ImageCache::new(FakeImporter::new(&log));
        let planes = [plane(0)];

        cache.get_or_import(1, 0, &request(&planes)).unwrap();
        cache.importer.fail = true;
        assert!(cache.get_or_import(2, 0, &request(&planes)).is_err());
        assert_eq!(cache.status(), ImportStatus::Works);
    }

    #[test]
    fn test_tiled_surface_rejected_without_modifiers() {
        let log = Rc::default();
        let mut importer = FakeImporter::new(&log);
        importer.modifiers = false;
        let mut cache = ImageCache::new(importer);

        let tiled = [plane(0x0100_0000_0000_0002)];
        assert!(matches!(
            cache.get_or_import(1, 0, &request(&tiled)),
            Err(ImportError::UnsupportedModifier(0x0100_0000_0000_0002))
        ));
        assert!(log.borrow().imported.is_empty());
    }

    #[test]
    fn test_implicit_modifier_counts_as_linear() {
        let log = Rc::default();
        let mut importer = FakeImporter::new(&log);
        importer.modifiers = false;
        let mut cache = ImageCache::new(importer);

        let implicit = [plane(DrmModifier::Invalid.into())];
        assert!(cache.get_or_import(1, 0, &request(&implicit)).is_ok());
    }

    #[test]
    fn test_clear_and_drop_destroy_everything() {
        let log = Rc::default();
        let mut cache = ImageCache::new(FakeImporter::new(&log));
        let planes = [plane(0)];

        cache.get_or_import(1, 0, &request(&planes)).unwrap();
        cache.get_or_import(2, 0, &request(&planes)).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.status(), ImportStatus::Works);
        assert_eq!(log.borrow().destroyed.len(), 2);

        cache.get_or_import(3, 0, &request(&planes)).unwrap();
        drop(cache);
        assert_eq!(log.borrow().destroyed.len(), 3);
    }
}
