//! Page trace decoding and visualization.
//!
//! Consumes the binary page traces emitted by a managed runtime's memory
//! manager: a per-processor log of page-level allocation, freeing and
//! scavenging. [`Trace`] indexes a trace from any [`ReadAt`] byte source,
//! [`Parser`] merges the per-processor streams into one time-ordered
//! [`Event`] stream, [`Simulator`] replays it into a page-granular
//! [`State`] bitmap, and [`TileTree`] serves zoomable occupancy tiles of
//! the address space over time.

// Modules
mod event;
mod parser;
mod read_at;
mod sim;
mod snapshot;
mod tile;
mod trace;
mod util;

#[cfg(test)]
pub(crate) mod testenc;

// Exports
pub use self::{
	event::{Event, Kind, PAGE_SHIFT, PAGE_SIZE},
	parser::Parser,
	read_at::ReadAt,
	sim::{Simulator, State},
	snapshot::take_snapshots,
	tile::{render_occupancy, TileImage, TileTree, TreeInfo, MAG_FACTOR, MIN_DURATION, MIN_MEM_CHUNK, TILE_SIZE},
	trace::Trace,
};

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::testenc::TraceBuilder,
		std::time::Duration,
	};

	/// Replays a whole trace through the simulator, validating every event
	#[test]
	fn replay_validates() -> Result<(), anyhow::Error> {
		let bytes = TraceBuilder::new()
			.pid(0)
			.sync(1024)
			.alloc(0x10000, 4, 0)
			.scav(0x10000, 4, 256)
			.pid(1)
			.sync(2048)
			.alloc(0x40000, 2, 0)
			.free(0x40000, 2, 512)
			.pid(0)
			.sync(4096)
			.free(0x10000, 4, 0)
			.finish();
		let trace = Trace::new(bytes)?;

		let mut parser = Parser::new(&trace);
		let mut sim = Simulator::new();
		let mut count = 0;
		while let Some(event) = parser.next()? {
			sim.validate(event)?;
			sim.feed(event);
			count += 1;
		}
		assert_eq!(count, 5);

		let state = sim.snapshot();
		assert_eq!(state.allocated(state.min_addr(), state.size()), 0);
		assert!(state.is_scavenged(0x10000));
		Ok(())
	}

	/// End to end: trace bytes to a rendered tile
	#[test]
	fn trace_to_tile() -> Result<(), anyhow::Error> {
		let bytes = TraceBuilder::new()
			.pid(0)
			.sync(0)
			.alloc(0x100000, 8, 0)
			.pid(0)
			.sync(1 << 20)
			.finish();
		let tree = TileTree::new(Trace::new(bytes)?)?;

		let info = tree.info();
		let tile = tree
			.get_tile(Duration::ZERO, info.min_addr, 0)?
			.expect("Origin tile must exist");

		let allocated = tile.pixels().iter().filter(|&&occupancy| occupancy > 0.0).count();
		assert!(allocated > 0);
		Ok(())
	}
}
