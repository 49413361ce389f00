//! Address space simulator

// Imports
use {
	crate::{
		event::{Event, Kind, PAGE_SIZE},
		util,
	},
	std::time::Duration,
};

/// Simulates the address space of the traced process.
///
/// Feed it the events of a [`Parser`](crate::Parser) in order to move
/// time forward.
#[derive(Clone, Default, Debug)]
pub struct Simulator {
	/// Timestamp of the last event fed
	clock: Duration,

	/// Current address space state
	state: State,
}

impl Simulator {
	/// Creates a simulator with an empty address space at time 0
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets up the simulator's state at a particular snapshot.
	///
	/// The state is cloned before use.
	pub fn set_state(&mut self, state: &State) {
		self.state = state.clone();
	}

	/// Returns an error if `event` is inconsistent with the current
	/// simulation state.
	///
	/// Useful for detecting errors in a trace or in its parsing. Must be
	/// called before [`Self::feed`]-ing the event, and never mutates.
	///
	/// # Errors
	/// Returns an error if the event is of a bad kind, isn't page-aligned,
	/// goes backwards in time, allocates an already-allocated page or frees
	/// a non-allocated page.
	pub fn validate(&self, event: Event) -> Result<(), anyhow::Error> {
		anyhow::ensure!(event.kind != Kind::Bad, "found bad event");
		anyhow::ensure!(
			event.base % PAGE_SIZE == 0,
			"base address {:#x} not aligned to page size",
			event.base
		);
		anyhow::ensure!(
			event.size % PAGE_SIZE == 0,
			"region size {:#x} not aligned to page size",
			event.size
		);
		anyhow::ensure!(event.time >= self.clock, "out-of-order event discovered");

		match event.kind {
			Kind::Allocate => {
				let amount = self.state.allocated(event.base, event.size);
				anyhow::ensure!(amount == 0, "double allocation discovered: want 0, got {amount}");
			},
			Kind::Free => {
				let amount = self.state.allocated(event.base, event.size);
				anyhow::ensure!(
					amount == event.size,
					"double free discovered: want {}, got {amount}",
					event.size
				);
			},
			_ => (),
		}

		Ok(())
	}

	/// Feeds an event into the simulator, moving time forward.
	///
	/// Never fails; an invalid event leaves the bitmaps unchanged.
	pub fn feed(&mut self, event: Event) {
		self.clock = event.time;
		self.state.update(event);
	}

	/// Returns the current state of memory.
	///
	/// The returned state must not be observed after the next
	/// [`Self::feed`] call; clone it first to keep it.
	pub fn snapshot(&self) -> &State {
		&self.state
	}
}

/// State of the address space at a point in the simulation.
///
/// Tracks one allocated bit and one scavenged bit per page, over a range
/// of pages that grows to cover every event seen.
#[derive(PartialEq, Eq, Clone, Default, Debug)]
pub struct State {
	/// Lowest address tracked by the bitmaps
	min_addr: u64,

	/// Allocation bits, one per page from `min_addr`
	alloc_bits: Vec<u8>,

	/// Scavenge bits, one per page from `min_addr`
	scav_bits: Vec<u8>,
}

impl State {
	/// Returns whether the page at `addr` is allocated
	pub fn is_allocated(&self, addr: u64) -> bool {
		if addr < self.min_addr() || addr >= self.max_addr() {
			return false;
		}
		let off = (addr - self.min_addr) / PAGE_SIZE;
		self.alloc_bits[(off / 8) as usize] & (1 << (off % 8)) != 0
	}

	/// Returns the amount of allocated memory in `[addr, addr+size)`, in bytes.
	///
	/// Partially covered pages count by overlap; memory outside the tracked
	/// range counts as unallocated.
	pub fn allocated(&self, addr: u64, size: u64) -> u64 {
		self.sum_overlap(addr, size, |page| self.is_allocated(page))
	}

	/// Returns whether the page at `addr` is free and scavenged.
	///
	/// Memory outside the tracked range is conservatively scavenged, so
	/// this returns true there.
	pub fn is_scavenged(&self, addr: u64) -> bool {
		if addr < self.min_addr() || addr >= self.max_addr() {
			return true;
		}
		let off = (addr - self.min_addr) / PAGE_SIZE;
		self.scav_bits[(off / 8) as usize] & (1 << (off % 8)) != 0
	}

	/// Returns the amount of scavenged memory in `[addr, addr+size)`, in bytes.
	///
	/// Like [`Self::allocated`], clamped to the tracked range: memory outside
	/// it contributes nothing here, despite [`Self::is_scavenged`] holding
	/// there.
	pub fn scavenged(&self, addr: u64, size: u64) -> u64 {
		self.sum_overlap(addr, size, |page| self.is_scavenged(page))
	}

	/// Returns the size of the tracked memory region, in bytes.
	///
	/// May be larger than the peak memory size described by the events fed,
	/// since the bitmaps grow in whole bytes.
	pub fn size(&self) -> u64 {
		self.alloc_bits.len() as u64 * 8 * PAGE_SIZE
	}

	/// Returns the minimum address tracked.
	///
	/// May be lower than the minimum address of any event fed.
	pub fn min_addr(&self) -> u64 {
		self.min_addr
	}

	/// Returns the maximum address tracked.
	///
	/// May be higher than the maximum address of any event fed.
	pub fn max_addr(&self) -> u64 {
		self.min_addr + self.size()
	}

	/// Sums the bytes of `[addr, addr+size)` whose page satisfies `covered`,
	/// counting partial head/tail pages by overlap
	fn sum_overlap(&self, addr: u64, size: u64, covered: impl Fn(u64) -> bool) -> u64 {
		let start = util::align_down(addr, PAGE_SIZE).max(self.min_addr());
		let end = util::align_up(addr.saturating_add(size).min(self.max_addr()), PAGE_SIZE);

		let mut sum = 0;
		let mut page = start;
		while page < end {
			if covered(page) {
				let lo = addr.max(page);
				let hi = addr.saturating_add(size).min(page + PAGE_SIZE);
				sum += hi - lo;
			}
			page += PAGE_SIZE;
		}
		sum
	}

	/// Updates the state with `event`, growing the bitmaps to cover its
	/// memory region
	pub(crate) fn update(&mut self, event: Event) {
		if !matches!(event.kind, Kind::Allocate | Kind::Free | Kind::Scavenge) {
			return;
		}

		let (min_addr, max_addr) = (event.base, event.base.saturating_add(event.size));
		if self.alloc_bits.is_empty() {
			self.min_addr = min_addr;
			let size = Self::bitmap_size(min_addr, max_addr);
			self.alloc_bits = vec![0; size];
			self.scav_bits = vec![0; size];
		} else {
			if max_addr > self.max_addr() {
				let new_size = Self::bitmap_size(self.min_addr, max_addr);
				if self.alloc_bits.len() < new_size {
					self.alloc_bits.resize(new_size, 0);
				}
				if self.scav_bits.len() < new_size {
					self.scav_bits.resize(new_size, 0);
				}
			}
			if min_addr < self.min_addr {
				// Grow the front in whole bytes, so the existing bit offsets
				// shift by an exact byte multiple.
				let grow_pages = util::align_up((self.min_addr - min_addr) / PAGE_SIZE, 8);
				let grow_bytes = (grow_pages / 8) as usize;
				self.min_addr -= grow_pages * PAGE_SIZE;
				self.alloc_bits = Self::prepend_zeros(&self.alloc_bits, grow_bytes);
				self.scav_bits = Self::prepend_zeros(&self.scav_bits, grow_bytes);
			}
		}

		let first = (event.base - self.min_addr) / PAGE_SIZE;
		let last = (max_addr - self.min_addr) / PAGE_SIZE;
		for page in first..last {
			let (byte, bit) = ((page / 8) as usize, page % 8);
			match event.kind {
				Kind::Allocate => {
					self.alloc_bits[byte] |= 1 << bit;
					self.scav_bits[byte] &= !(1 << bit);
				},
				Kind::Free => self.alloc_bits[byte] &= !(1 << bit),
				Kind::Scavenge => self.scav_bits[byte] |= 1 << bit,
				Kind::Bad => unreachable!(),
			}
		}
	}

	/// Returns the bitmap size, in bytes, covering `[min_addr, max_addr)`
	fn bitmap_size(min_addr: u64, max_addr: u64) -> usize {
		(util::align_up(util::align_up(max_addr - min_addr, PAGE_SIZE) / PAGE_SIZE, 8) / 8) as usize
	}

	/// Returns `bits` with `count` zero bytes prepended
	fn prepend_zeros(bits: &[u8], count: usize) -> Vec<u8> {
		let mut grown = vec![0; count];
		grown.extend_from_slice(bits);
		grown
	}
}
