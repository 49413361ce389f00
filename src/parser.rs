//! Merge parser

// Imports
use {
	crate::{
		event::{EncodedEvent, Event, EventHeader, HeaderKind},
		read_at::ReadAt,
		trace::{pid_from_index, pid_index, Trace},
	},
	anyhow::Context,
	byteorder::{ByteOrder, LittleEndian},
	itertools::Itertools,
};

/// Parser for a page trace.
///
/// Merges the per-processor event streams of a [`Trace`] into a single
/// stream ordered by reconstructed timestamp.
#[derive(Debug)]
pub struct Parser<R> {
	/// Trace being parsed.
	///
	/// A private clone; its block lists are consumed as the parser advances.
	trace: Trace<R>,

	/// Most recent sync timestamp per processor index
	clocks: Vec<i64>,

	/// Next pending event per processor index, `None` once exhausted
	events: Vec<Option<EncodedEvent>>,

	/// Whether `clocks` and `events` have been initialized
	started: bool,
}

impl<R: ReadAt> Parser<R> {
	/// Creates a parser for `trace`, which it clones
	pub fn new(trace: &Trace<R>) -> Self {
		Self {
			trace:   trace.clone(),
			clocks:  vec![],
			events:  vec![],
			started: false,
		}
	}

	/// Returns the next event in the merged stream, or `None` at the end
	/// of the stream.
	///
	/// Events are emitted with non-decreasing timestamps. Events before the
	/// trace slice's start are skipped, and the first event past its end
	/// terminates the stream.
	///
	/// # Errors
	/// Returns an error if the trace is malformed or the source fails to read.
	pub fn next(&mut self) -> Result<Option<Event>, anyhow::Error> {
		self.init()?;

		loop {
			// Pick the P with the smallest reconstructed timestamp,
			// breaking ties towards the lowest index.
			let mut next_pidx = None;
			let mut min_timestamp = i64::MAX;
			for (pidx, event) in self.events.iter().enumerate() {
				let Some(event) = event else { continue };
				let timestamp = self.clocks[pidx] + event.header.timestamp_delta();
				if timestamp < min_timestamp {
					min_timestamp = timestamp;
					next_pidx = Some(pidx);
				}
			}
			let Some(pidx) = next_pidx else {
				return Ok(None);
			};

			let encoded = self.events[pidx].expect("Chosen P must have a pending event");
			let event = encoded.decode(pid_from_index(pidx), min_timestamp, self.trace.min_trace_time());
			if event.time > self.trace.time_end() {
				return Ok(None);
			}

			self.events[pidx] = self.refresh_event(pidx)?;
			if event.time < self.trace.time_start() {
				continue;
			}
			return Ok(Some(event));
		}
	}

	/// Returns the as-yet unparsed part of the trace
	pub fn rest(&self) -> Trace<R> {
		let mut trace = self.trace.clone();
		if !self.started {
			return trace;
		}

		let min_timestamp = self
			.events
			.iter()
			.enumerate()
			.filter_map(|(pidx, event)| {
				event
					.as_ref()
					.map(|event| self.clocks[pidx] + event.header.timestamp_delta())
			})
			.min();
		trace.set_start_time(min_timestamp.unwrap_or_else(|| self.trace.abs_end_time()));
		trace
	}

	/// Initializes the per-processor clocks and pending events
	fn init(&mut self) -> Result<(), anyhow::Error> {
		if self.started {
			return Ok(());
		}
		self.started = true;

		let len = self.trace.blocks().len();
		self.clocks = vec![0; len];
		let events: Vec<_> = (0..len).map(|pidx| self.refresh_event(pidx)).try_collect()?;
		self.events = events;

		Ok(())
	}

	/// Reads the next fully-encoded event from P index `pidx`'s stream.
	///
	/// Returns `None` once the stream is exhausted, either by running out of
	/// blocks or by hitting a zero padding word. A zero word right after a
	/// pid word is not padding: it is the block's opening sync, with
	/// timestamp 0.
	fn refresh_event(&mut self, pidx: usize) -> Result<Option<EncodedEvent>, anyhow::Error> {
		let mut want_sync = false;
		loop {
			let word = self.read8(pidx)?;
			if word == 0 && !want_sync {
				return Ok(None);
			}

			let header = EventHeader(word);
			match header.kind() {
				HeaderKind::Sync => {
					self.clocks[pidx] = header.sync_timestamp();
					want_sync = false;
					continue;
				},
				HeaderKind::Pid => {
					anyhow::ensure!(
						pid_index(header.pid()) == pidx,
						"malformed trace: encountered pid event for P {}, but expected P {}",
						header.pid(),
						pid_from_index(pidx)
					);
					want_sync = true;
					continue;
				},
				_ => (),
			}

			let npages = match header.is_large() {
				true => self.read8(pidx).context("Unable to read npages trailer")?,
				false => header.npages_small(),
			};
			return Ok(Some(EncodedEvent { header, npages }));
		}
	}

	/// Reads the next 8 bytes of P index `pidx`'s block list.
	///
	/// Returns 0 once the block list is exhausted.
	fn read8(&mut self, pidx: usize) -> Result<u64, anyhow::Error> {
		let Some(&interval) = self.trace.blocks()[pidx].first() else {
			return Ok(0);
		};

		let mut buf = [0_u8; 8];
		self.trace
			.reader()
			.read_exact_at(&mut buf, interval.start)
			.with_context(|| format!("Unable to read event stream for P {}", pid_from_index(pidx)))?;

		let blocks = &mut self.trace.blocks_mut()[pidx];
		match interval.start + 8 == interval.end {
			true => {
				blocks.remove(0);
			},
			false => blocks[0].start += 8,
		}

		Ok(LittleEndian::read_u64(&buf))
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			event::{Kind, PAGE_SIZE},
			testenc::TraceBuilder,
		},
		std::time::Duration,
	};

	/// Collects every event of a parser over `trace`
	fn parse_all(trace: &Trace<Vec<u8>>) -> Result<Vec<Event>, anyhow::Error> {
		let mut parser = Parser::new(trace);
		std::iter::from_fn(|| parser.next().transpose()).collect()
	}

	#[test]
	fn single_allocation() -> Result<(), anyhow::Error> {
		let bytes = TraceBuilder::new().pid(0).sync(0).alloc(0x10000, 2, 0).finish();
		let trace = Trace::new(bytes)?;

		let events = parse_all(&trace)?;
		assert_eq!(events, vec![Event {
			kind: Kind::Allocate,
			p:    0,
			time: Duration::ZERO,
			base: 0x10000,
			size: 2 * PAGE_SIZE,
		}]);
		Ok(())
	}

	#[test]
	fn interleaved_processors() -> Result<(), anyhow::Error> {
		// P 0 syncs later than P 1, so P 1's event must come out first
		let bytes = TraceBuilder::new()
			.pid(0)
			.sync(1024)
			.alloc(0x10000, 1, 0)
			.pid(1)
			.sync(512)
			.alloc(0x20000, 1, 0)
			.finish();
		let trace = Trace::new(bytes)?;

		let events = parse_all(&trace)?;
		assert_eq!(events.len(), 2);
		assert_eq!(events[0].p, 1);
		assert_eq!(events[0].time, Duration::ZERO);
		assert_eq!(events[1].p, 0);
		assert_eq!(events[1].time, Duration::from_nanos(512));
		Ok(())
	}

	#[test]
	fn large_event() -> Result<(), anyhow::Error> {
		let bytes = TraceBuilder::new().pid(0).sync(0).alloc_large(0x20000, 1000, 0).finish();
		let trace = Trace::new(bytes)?;

		let events = parse_all(&trace)?;
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].kind, Kind::Allocate);
		assert_eq!(events[0].size, 1000 * PAGE_SIZE);
		assert!(trace.max_addr() >= 0x20000 + 1000 * PAGE_SIZE);
		Ok(())
	}

	#[test]
	fn events_are_ordered_and_aligned() -> Result<(), anyhow::Error> {
		let bytes = TraceBuilder::new()
			.pid(1)
			.sync(1024)
			.alloc(0x30000, 4, 0)
			.scav(0x30000, 2, 256)
			.pid(0)
			.sync(512)
			.alloc_large(0x100000, 600, 0)
			.free_large(0x100000, 600, 384)
			.pid(1)
			.sync(4096)
			.free(0x30000, 4, 128)
			.finish();
		let trace = Trace::new(bytes)?;

		let events = parse_all(&trace)?;
		assert_eq!(events.len(), 5);
		for window in events.windows(2) {
			assert!(window[0].time <= window[1].time);
		}
		for event in &events {
			assert_eq!(event.base % PAGE_SIZE, 0);
			assert_eq!(event.size % PAGE_SIZE, 0);
		}
		Ok(())
	}

	#[test]
	fn slice_boundaries_are_inclusive() -> Result<(), anyhow::Error> {
		// Events at 0, 128, 256 and 384ns since the trace start
		let bytes = TraceBuilder::new()
			.pid(0)
			.sync(0)
			.alloc(0x10000, 1, 0)
			.alloc(0x20000, 1, 128)
			.alloc(0x30000, 1, 256)
			.alloc(0x40000, 1, 384)
			.finish();
		let trace = Trace::new(bytes)?;

		let sliced = trace.slice(Duration::from_nanos(128), Duration::from_nanos(256));
		let events = parse_all(&sliced)?;
		assert_eq!(
			events.iter().map(|event| event.time.as_nanos()).collect::<Vec<_>>(),
			vec![128, 256]
		);
		Ok(())
	}

	#[test]
	fn full_slice_matches_unsliced() -> Result<(), anyhow::Error> {
		let bytes = TraceBuilder::new()
			.pid(0)
			.sync(0)
			.alloc(0x10000, 1, 0)
			.free(0x10000, 1, 256)
			.pid(1)
			.sync(128)
			.alloc(0x50000, 3, 0)
			.finish();
		let trace = Trace::new(bytes)?;

		let all = parse_all(&trace)?;
		let sliced = parse_all(&trace.slice(Duration::ZERO, trace.duration()))?;
		itertools::assert_equal(all, sliced);
		Ok(())
	}

	#[test]
	fn clone_parses_identically() -> Result<(), anyhow::Error> {
		let bytes = TraceBuilder::new()
			.pid(0)
			.sync(0)
			.alloc(0x10000, 2, 0)
			.scav(0x10000, 1, 128)
			.finish();
		let trace = Trace::new(bytes)?;

		itertools::assert_equal(parse_all(&trace)?, parse_all(&trace.clone())?);
		Ok(())
	}

	#[test]
	fn padding_ends_a_block() -> Result<(), anyhow::Error> {
		let bytes = TraceBuilder::new()
			.pid(0)
			.sync(1024)
			.alloc(0x10000, 1, 0)
			.word(0)
			.word(0)
			.finish();
		let trace = Trace::new(bytes)?;

		let events = parse_all(&trace)?;
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].base, 0x10000);
		Ok(())
	}

	#[test]
	fn rest_is_the_unparsed_suffix() -> Result<(), anyhow::Error> {
		let bytes = TraceBuilder::new()
			.pid(0)
			.sync(0)
			.alloc(0x10000, 1, 0)
			.alloc(0x20000, 1, 256)
			.finish();
		let trace = Trace::new(bytes)?;

		// Nothing parsed yet: the rest is the whole trace
		let parser = Parser::new(&trace);
		assert_eq!(parser.rest().time_start(), Duration::ZERO);

		// One event in: the rest starts at the pending event
		let mut parser = Parser::new(&trace);
		parser.next()?;
		assert_eq!(parser.rest().time_start(), Duration::from_nanos(256));

		// Fully drained: the rest is empty
		while parser.next()?.is_some() {}
		let rest = parser.rest();
		assert_eq!(rest.time_start(), rest.time_end());
		Ok(())
	}
}
