//! Size classes and span classes.
//!
//! Small objects are routed to the smallest size class that fits them.
//! Each size class comes in two span-class flavors: one for objects the
//! collector must scan for pointers, one for pointer-free (noscan)
//! objects. Class 0 is reserved for large, single-object spans.

/// Log2 of the allocator page size.
pub const PAGE_SHIFT: usize = 13;

/// Size of each allocator page (8 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// One size class: the object size it serves and how many pages a span
/// of this class occupies.
#[derive(Debug, Clone, Copy)]
pub struct SizeClassSpec {
    /// Object size in bytes. Zero for the reserved large class.
    pub size: usize,
    /// Pages per span, chosen to keep per-span waste low.
    pub pages: usize,
}

/// Size class table. Entry 0 is the reserved large-object class.
pub const SIZE_CLASSES: [SizeClassSpec; 24] = [
    SizeClassSpec { size: 0, pages: 0 },
    SizeClassSpec { size: 8, pages: 1 },
    SizeClassSpec { size: 16, pages: 1 },
    SizeClassSpec { size: 32, pages: 1 },
    SizeClassSpec { size: 48, pages: 1 },
    SizeClassSpec { size: 64, pages: 1 },
    SizeClassSpec { size: 96, pages: 1 },
    SizeClassSpec { size: 128, pages: 1 },
    SizeClassSpec { size: 192, pages: 1 },
    SizeClassSpec { size: 256, pages: 1 },
    SizeClassSpec { size: 384, pages: 1 },
    SizeClassSpec { size: 512, pages: 1 },
    SizeClassSpec { size: 768, pages: 1 },
    SizeClassSpec { size: 1024, pages: 1 },
    SizeClassSpec { size: 1536, pages: 1 },
    SizeClassSpec { size: 2048, pages: 1 },
    SizeClassSpec { size: 3072, pages: 3 },
    SizeClassSpec { size: 4096, pages: 1 },
    SizeClassSpec { size: 6144, pages: 3 },
    SizeClassSpec { size: 8192, pages: 1 },
    SizeClassSpec { size: 12288, pages: 3 },
    SizeClassSpec { size: 16384, pages: 2 },
    SizeClassSpec { size: 24576, pages: 3 },
    SizeClassSpec { size: 32768, pages: 4 },
];

/// Number of size classes, including the reserved large class.
pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Number of span classes (each size class has scan and noscan flavors).
pub const NUM_SPAN_CLASSES: usize = NUM_SIZE_CLASSES << 1;

/// Objects larger than this go through the large-object path.
pub const MAX_SMALL_SIZE: usize = SIZE_CLASSES[NUM_SIZE_CLASSES - 1].size;

/// The reserved size-class id for large, single-object spans.
pub const LARGE_SIZE_CLASS: usize = 0;

/// Maximum size (exclusive) eligible for the tiny allocator.
pub const TINY_MAX: usize = 16;

/// Size class used to carve tiny-allocation blocks.
pub const TINY_SIZE_CLASS: usize = 2; // the 16-byte class

/// A size class paired with its scan/noscan flavor.
///
/// Encoded as `class << 1 | noscan`, so the span class doubles as an
/// index into per-span-class tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanClass(u8);

impl SpanClass {
    /// Builds a span class from a size-class id and a noscan flag.
    #[must_use]
    pub const fn new(size_class: usize, noscan: bool) -> Self {
        Self(((size_class << 1) | noscan as usize) as u8)
    }

    /// The size-class id.
    #[must_use]
    pub const fn size_class(self) -> usize {
        (self.0 >> 1) as usize
    }

    /// Whether spans of this class hold pointer-free objects.
    #[must_use]
    pub const fn is_noscan(self) -> bool {
        self.0 & 1 != 0
    }

    /// Index into per-span-class tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Inverse of [`index`](Self::index).
    #[must_use]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u8)
    }
}

/// Span class used for tiny-allocation blocks (16-byte, noscan).
pub const TINY_SPAN_CLASS: SpanClass = SpanClass::new(TINY_SIZE_CLASS, true);

/// Returns the smallest size class that fits `size`.
///
/// # Panics
///
/// Panics if `size` exceeds [`MAX_SMALL_SIZE`]; such requests belong on
/// the large-object path.
#[must_use]
pub fn size_to_class(size: usize) -> usize {
    assert!(size <= MAX_SMALL_SIZE, "size {size} is not a small object");
    let mut class = 1;
    while SIZE_CLASSES[class].size < size {
        class += 1;
    }
    class
}

/// Objects per span for the given size class.
#[must_use]
pub const fn class_nelems(size_class: usize) -> usize {
    let spec = SIZE_CLASSES[size_class];
    spec.pages * PAGE_SIZE / spec.size
}
