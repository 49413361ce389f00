//! Page trace container and indexer

// Imports
use {
	crate::{
		event::{EventHeader, HeaderKind, PAGE_SIZE},
		read_at::ReadAt,
		util,
	},
	anyhow::Context,
	byteorder::{ByteOrder, LittleEndian},
	std::{sync::Arc, time::Duration},
};

/// Size of the indexer's read buffer
const INDEX_BUF_SIZE: usize = 32 << 10;

/// A byte interval of the trace holding one processor-local block of events.
///
/// Both `start` and `end` are multiples of 8, and the interval begins at a
/// pid word followed by a sync word.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
pub(crate) struct Interval {
	/// Byte range `[start, end)` into the trace
	pub start: u64,
	pub end:   u64,

	/// Absolute time range `[start_time, end_time]` of the block.
	///
	/// `start_time` is the timestamp of the sync event opening the block;
	/// `end_time` is the timestamp of the last event seen before the block
	/// was closed.
	pub start_time: i64,
	pub end_time:   i64,
}

/// A slice of a page trace in time.
///
/// Created over a byte source by [`Trace::new`], which indexes the whole
/// trace once; [`Trace::slice`] then restricts it in time without touching
/// the source again.
#[derive(Debug)]
pub struct Trace<R> {
	/// Byte source, shared by all clones and slices
	reader: Arc<R>,

	/// Per-processor event block lists, indexed by `pid + 1`
	blocks: Vec<Vec<Interval>>,

	/// Absolute timestamp of the true start of the trace.
	///
	/// Unlike `start_time` this survives slicing; every public time is
	/// relative to it.
	min_trace_time: i64,

	/// Absolute time range covered by this slice
	start_time: i64,
	end_time:   i64,

	/// Address extents of the whole trace, 0 when no memory event exists
	min_addr: u64,
	max_addr: u64,
}

/// Converts a P id into a block list index.
///
/// Adds 1 so that the "no processor" id of -1 lands at index 0.
pub(crate) fn pid_index(pid: i32) -> usize {
	(pid + 1) as usize
}

/// Converts a block list index back into a P id
pub(crate) fn pid_from_index(pidx: usize) -> i32 {
	pidx as i32 - 1
}

impl<R: ReadAt> Trace<R> {
	/// Indexes an encoded page trace from `reader`.
	///
	/// The returned trace covers the full stream from beginning to end.
	///
	/// # Errors
	/// Returns an error if the stream is malformed or the source fails to read.
	pub fn new(reader: R) -> Result<Self, anyhow::Error> {
		let reader = Arc::new(reader);
		let mut buf = vec![0_u8; INDEX_BUF_SIZE];
		let mut cursor = 0_u64;

		// Indexing state. `cur_time` is the timestamp of the most recent
		// timestamped word, and becomes the end time of a block when it closes.
		let mut expect_npages_trailer = false;
		let mut want_time = false;
		let mut trailer_base = 0_u64;
		let mut sync_time = 0_i64;
		let mut cur_time = 0_i64;

		// Extents. 0 doubles as "unset" for the addresses; the start time
		// can genuinely be 0, so it gets a real unset state.
		let mut start_time: Option<i64> = None;
		let mut end_time = 0_i64;
		let mut min_addr = 0_u64;
		let mut max_addr = 0_u64;

		// The block currently being filled. It only gets an owner once the
		// first pid word shows up, so a trace with leading padding doesn't
		// produce a stray block.
		let mut blocks: Vec<Vec<Interval>> = vec![];
		let mut cur = Interval::default();
		let mut cur_owner: Option<usize> = None;

		loop {
			let n = reader
				.read_full_at(&mut buf, cursor)
				.context("Unable to read trace")?;
			anyhow::ensure!(n % 8 == 0, "malformed trace: size is not a multiple of 8");

			for j in (0..n).step_by(8) {
				let word = LittleEndian::read_u64(&buf[j..j + 8]);

				if expect_npages_trailer {
					// This word is the npages trailer of the previous large event.
					let max = trailer_base.saturating_add(word.saturating_mul(PAGE_SIZE));
					if max_addr == 0 || max > max_addr {
						max_addr = max;
					}
					expect_npages_trailer = false;
					continue;
				}

				// Zero words are padding at the tail of a block. They carry no
				// time, and must not disturb the running clocks, or slicing
				// would drop the padded block. A zero word where a block's
				// opening sync is expected is not padding: it is that sync,
				// with timestamp 0.
				if word == 0 && !want_time {
					continue;
				}

				let header = EventHeader(word);
				if header.kind() != HeaderKind::Pid {
					match header.kind() {
						HeaderKind::Sync => {
							cur_time = header.sync_timestamp();
							sync_time = cur_time;
						},
						_ => {
							if header.is_large() {
								expect_npages_trailer = true;
								trailer_base = header.base();
							} else {
								let max = header.base() + header.npages_small() * PAGE_SIZE;
								if max_addr == 0 || max > max_addr {
									max_addr = max;
								}
							}

							let min = header.base();
							if min_addr == 0 || min < min_addr {
								min_addr = min;
							}
							cur_time = sync_time + header.timestamp_delta();
						},
					}
					if cur_time > end_time {
						end_time = cur_time;
					}
				}

				if want_time {
					anyhow::ensure!(
						header.kind() == HeaderKind::Sync,
						"malformed trace: expected sync event immediately following pid event"
					);

					let time = header.sync_timestamp();
					if start_time.map_or(true, |start| time < start) {
						start_time = Some(time);
					}
					cur.start_time = time;
					want_time = false;
					continue;
				}
				if header.kind() != HeaderKind::Pid {
					continue;
				}

				// A pid word closes the current block and opens a new one.
				let pid = header.pid();
				anyhow::ensure!(pid >= -1, "malformed trace: invalid processor id {pid}");

				cur.end = cursor + j as u64;
				cur.end_time = cur_time;
				if let Some(pidx) = cur_owner {
					blocks[pidx].push(cur);
				}

				let pidx = pid_index(pid);
				if blocks.len() < pidx + 1 {
					blocks.resize_with(pidx + 1, Vec::new);
				}
				cur = Interval {
					start: cursor + j as u64,
					..Interval::default()
				};
				cur_owner = Some(pidx);
				want_time = true;
			}

			cursor += n as u64;
			if n < buf.len() {
				break;
			}
		}

		// Close the final block at the end of the stream
		cur.end = cursor;
		cur.end_time = cur_time;
		if let Some(pidx) = cur_owner {
			blocks[pidx].push(cur);
		}

		let start_time = start_time.unwrap_or(0);
		tracing::debug!(start_time, end_time, min_addr, max_addr, "Indexed page trace");

		Ok(Self {
			reader,
			blocks,
			min_trace_time: start_time,
			start_time,
			end_time,
			min_addr,
			max_addr,
		})
	}
}

impl<R> Trace<R> {
	/// Returns the wall-time duration of this trace slice
	pub fn duration(&self) -> Duration {
		util::rel_time(self.end_time, self.start_time)
	}

	/// Returns the start time of this slice since the true start of the trace.
	///
	/// A trace returned by [`Trace::new`] returns 0.
	pub fn time_start(&self) -> Duration {
		util::rel_time(self.start_time, self.min_trace_time)
	}

	/// Returns the end time of this slice since the true start of the trace.
	///
	/// A trace returned by [`Trace::new`] returns the trace duration.
	pub fn time_end(&self) -> Duration {
		util::rel_time(self.end_time, self.min_trace_time)
	}

	/// Returns the minimum address of any memory event in the trace.
	///
	/// This describes the whole trace, not the slice. 0 if the trace has
	/// no memory events.
	pub fn min_addr(&self) -> u64 {
		self.min_addr
	}

	/// Returns the maximum address of any memory event in the trace.
	///
	/// This describes the whole trace, not the slice. 0 if the trace has
	/// no memory events.
	pub fn max_addr(&self) -> u64 {
		self.max_addr
	}

	/// Creates a slice of this trace from time `s` to time `e`.
	///
	/// Both times are relative to the true start of the trace, not to this
	/// slice, and are clamped to this slice's bounds. If the clamped range
	/// is empty, the result is an empty trace.
	pub fn slice(&self, s: Duration, e: Duration) -> Self {
		let mut start = self.min_trace_time + s.as_nanos() as i64;
		let mut end = self.min_trace_time + e.as_nanos() as i64;
		start = start.max(self.start_time);
		end = end.min(self.end_time);

		let mut sliced = Self {
			reader: Arc::clone(&self.reader),
			blocks: vec![vec![]; self.blocks.len()],
			min_trace_time: self.min_trace_time,
			start_time: self.min_trace_time,
			end_time: self.min_trace_time,
			min_addr: self.min_addr,
			max_addr: self.max_addr,
		};
		if end <= start {
			return sliced;
		}
		sliced.start_time = start;
		sliced.end_time = end;

		for (pidx, intervals) in self.blocks.iter().enumerate() {
			for &interval in intervals {
				if interval.end_time < start || interval.start_time > end {
					continue;
				}
				sliced.blocks[pidx].push(interval);
			}
		}

		sliced
	}

	/// Returns the shared byte source
	pub(crate) fn reader(&self) -> &R {
		&self.reader
	}

	/// Returns the per-processor block lists
	pub(crate) fn blocks(&self) -> &Vec<Vec<Interval>> {
		&self.blocks
	}

	/// Returns the per-processor block lists for consumption by a parser
	pub(crate) fn blocks_mut(&mut self) -> &mut Vec<Vec<Interval>> {
		&mut self.blocks
	}

	/// Returns the absolute timestamp of the true start of the trace
	pub(crate) fn min_trace_time(&self) -> i64 {
		self.min_trace_time
	}

	/// Returns the absolute end timestamp of this slice
	pub(crate) fn abs_end_time(&self) -> i64 {
		self.end_time
	}

	/// Replaces the absolute start time of this slice
	pub(crate) fn set_start_time(&mut self, start_time: i64) {
		self.start_time = start_time;
	}
}

impl<R> Clone for Trace<R> {
	fn clone(&self) -> Self {
		Self {
			reader: Arc::clone(&self.reader),
			blocks: self.blocks.clone(),
			min_trace_time: self.min_trace_time,
			start_time: self.start_time,
			end_time: self.end_time,
			min_addr: self.min_addr,
			max_addr: self.max_addr,
		}
	}
}
