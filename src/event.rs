//! Trace events

// Imports
use {
	crate::util,
	std::{fmt, time::Duration},
};

/// Bits used by the event kind, in the low bits of every header word
pub(crate) const KIND_BITS: u32 = 3;

/// Mask for the event kind bits
pub(crate) const KIND_MASK: u64 = (1 << KIND_BITS) - 1;

/// Log2 of the page size
pub const PAGE_SHIFT: u32 = 13;

/// Size of a page, in bytes.
///
/// Every event address and size is a multiple of this.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Low bits of an absolute timestamp dropped by the sync encoding
pub(crate) const TIME_LOST_BITS: u32 = 7;

/// Bits of the per-event timestamp delta
pub(crate) const TIME_DELTA_BITS: u32 = 16;

/// Bits of a heap address
pub(crate) const HEAP_ADDR_BITS: u32 = 48;

/// Bits of the small npages field
pub(crate) const NPAGES_SMALL_BITS: u32 = 10;

/// Raw kind of an encoded header word.
///
/// The values are the wire encoding. Kinds at or above [`Self::AllocLarge`]
/// are the memory kinds with the *large* bit set, and are followed on the
/// wire by an 8-byte npages trailer.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) enum HeaderKind {
	Sync       = 0,
	Alloc      = 1,
	Free       = 2,
	Scav       = 3,
	Pid        = 4,
	AllocLarge = 5,
	FreeLarge  = 6,
	ScavLarge  = 7,
}

impl HeaderKind {
	/// Returns the kind encoded in the low 3 bits of `bits`
	fn from_bits(bits: u64) -> Self {
		match bits & KIND_MASK {
			0 => Self::Sync,
			1 => Self::Alloc,
			2 => Self::Free,
			3 => Self::Scav,
			4 => Self::Pid,
			5 => Self::AllocLarge,
			6 => Self::FreeLarge,
			7 => Self::ScavLarge,
			_ => unreachable!(),
		}
	}
}

/// An encoded 8-byte event header.
///
/// For most events this is the entire event; large memory events are
/// followed by an 8-byte npages trailer word.
#[derive(PartialEq, Eq, Clone, Copy)]
pub(crate) struct EventHeader(pub u64);

impl EventHeader {
	/// Returns the kind of this header
	pub fn kind(self) -> HeaderKind {
		HeaderKind::from_bits(self.0)
	}

	/// Returns the kind, ignoring the *large* bit.
	///
	/// The only possible results are `Sync`, `Alloc`, `Free` or `Scav`.
	pub fn kind_no_large(self) -> HeaderKind {
		HeaderKind::from_bits(self.0 & (KIND_MASK >> 1))
	}

	/// Returns whether this event refers to a large memory region.
	///
	/// # Panics
	/// Panics if the kind is `Sync` or `Pid`.
	pub fn is_large(self) -> bool {
		match self.kind() {
			HeaderKind::Sync | HeaderKind::Pid => panic!("is_large called on a sync or pid event"),
			_ => self.0 & (1 << 2) != 0,
		}
	}

	/// Returns the processor id stored in this header.
	///
	/// # Panics
	/// Panics if the kind isn't `Pid`.
	pub fn pid(self) -> i32 {
		match self.kind() {
			HeaderKind::Pid => ((self.0 as i64) >> KIND_BITS) as i32,
			_ => panic!("pid called on a non-pid event"),
		}
	}

	/// Returns the absolute timestamp stored in this header, in nanoseconds.
	///
	/// The low [`TIME_LOST_BITS`] bits of the original timestamp are lost
	/// to the encoding.
	///
	/// # Panics
	/// Panics if the kind isn't `Sync`.
	pub fn sync_timestamp(self) -> i64 {
		match self.kind() {
			HeaderKind::Sync => ((self.0 & !KIND_MASK) as i64) << (TIME_LOST_BITS - KIND_BITS),
			_ => panic!("sync_timestamp called on a non-sync event"),
		}
	}

	/// Returns the timestamp delta to the enclosing sync event, in nanoseconds.
	///
	/// The delta field's unit is `1 << TIME_LOST_BITS` nanoseconds, so the
	/// shift already converts it.
	///
	/// # Panics
	/// Panics if the kind is `Sync` or `Pid`.
	pub fn timestamp_delta(self) -> i64 {
		match self.kind() {
			HeaderKind::Sync | HeaderKind::Pid => panic!("timestamp_delta called on a sync or pid event"),
			_ => (self.0 >> ((64 - TIME_DELTA_BITS) - TIME_LOST_BITS)) as i64,
		}
	}

	/// Returns the base address of the memory region of this event.
	///
	/// # Panics
	/// Panics if the kind is `Sync` or `Pid`.
	pub fn base(self) -> u64 {
		match self.kind() {
			HeaderKind::Sync | HeaderKind::Pid => panic!("base called on a sync or pid event"),
			_ => self.0 & !(PAGE_SIZE - 1) & ((1 << HEAP_ADDR_BITS) - 1),
		}
	}

	/// Returns the size of the memory region of this event, in pages.
	///
	/// # Panics
	/// Panics if the kind is `Sync` or `Pid`, or if the event is large.
	pub fn npages_small(self) -> u64 {
		match self.kind() {
			HeaderKind::Sync | HeaderKind::Pid => panic!("npages_small called on a sync or pid event"),
			_ if self.is_large() => panic!("npages_small called on a large event"),
			_ => (self.0 >> KIND_BITS) & ((1 << NPAGES_SMALL_BITS) - 1),
		}
	}
}

impl fmt::Debug for EventHeader {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("EventHeader")
			.field(&format_args!("{:#018x}", self.0))
			.finish()
	}
}

/// Decoded event kind
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum Kind {
	/// Not a valid memory event
	Bad,

	/// Pages were allocated
	Allocate,

	/// Pages were freed
	Free,

	/// Pages were scavenged.
	///
	/// Allocating a page unscavenges it.
	Scavenge,
}

impl fmt::Display for Kind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Bad => f.pad("ERROR"),
			Self::Allocate => f.pad("Alloc"),
			Self::Free => f.pad("Free"),
			Self::Scavenge => f.pad("Scav"),
		}
	}
}

/// A single decoded event in the page trace
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Event {
	/// Event kind
	pub kind: Kind,

	/// Id of the P this event occurred on.
	///
	/// `-1` if the event happened without a P.
	pub p: i32,

	/// Timestamp of the event, since the start of the trace
	pub time: Duration,

	/// Base address of the memory region this event happened to
	pub base: u64,

	/// Size of the memory region, in bytes
	pub size: u64,
}

impl fmt::Display for Event {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"[P {} {}.{:09}] {}({:#x}, {})",
			self.p,
			self.time.as_secs(),
			self.time.subsec_nanos(),
			self.kind,
			self.base,
			self.size
		)
	}
}

/// A complete encoded event: the header word plus the npages trailer,
/// if the event had one.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) struct EncodedEvent {
	/// Header word
	pub header: EventHeader,

	/// Size of the memory region, in pages
	pub npages: u64,
}

impl EncodedEvent {
	/// Decodes this event into an [`Event`].
	///
	/// `timestamp` is the reconstructed absolute timestamp of the event and
	/// `min_trace_time` the absolute start of the whole trace.
	///
	/// # Panics
	/// Panics if the header is a sync or pid event.
	pub fn decode(self, p: i32, timestamp: i64, min_trace_time: i64) -> Event {
		let kind = match self.header.kind_no_large() {
			HeaderKind::Alloc => Kind::Allocate,
			HeaderKind::Free => Kind::Free,
			HeaderKind::Scav => Kind::Scavenge,
			_ => panic!("cannot decode a sync or pid event"),
		};

		Event {
			kind,
			p,
			time: util::rel_time(timestamp, min_trace_time),
			base: self.header.base(),
			size: PAGE_SIZE.saturating_mul(self.npages),
		}
	}
}
