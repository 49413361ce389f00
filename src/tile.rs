//! Tile tree

// Imports
use {
	crate::{read_at::ReadAt, sim::State, snapshot::take_snapshots, trace::Trace, util},
	anyhow::Context,
	std::{
		sync::{Arc, Mutex},
		time::Duration,
	},
};

/// Number of snapshot columns (and pixel rows) in a tile
pub const TILE_SIZE: usize = 256;

/// Zoom factor between adjacent tile depths
pub const MAG_FACTOR: usize = 2;

/// Time covered by one pixel column at the deepest zoom, in nanoseconds
pub const MIN_DURATION: u64 = 8192;

/// Memory covered by one pixel row at the deepest zoom, in bytes
pub const MIN_MEM_CHUNK: u64 = 8192;

/// Time covered by a whole tile at the deepest zoom, in nanoseconds
const MIN_TILE_DURATION: u64 = MIN_DURATION * TILE_SIZE as u64;

/// Memory covered by a whole tile at the deepest zoom, in bytes
const MIN_TILE_MEM_CHUNK: u64 = MIN_MEM_CHUNK * TILE_SIZE as u64;

/// Time and address window of a tile
#[derive(Clone, Copy, Debug)]
struct Span {
	/// Time window, in nanoseconds since the trace start
	min_time: u64,
	max_time: u64,

	/// Address window
	min_addr: u64,
	max_addr: u64,
}

/// A node of the tile tree.
///
/// Holds one state snapshot per tile column over its time window, plus
/// lazily-built children at twice the time resolution. The snapshots are
/// published at construction and read-only afterwards.
#[derive(Debug)]
struct SnapNode {
	/// Time window of this node, in nanoseconds since the trace start
	min_time: u64,
	max_time: u64,

	/// One snapshot per tile column, `None` where nothing was captured
	snaps: Vec<Option<State>>,

	/// Children, one per time sub-window.
	///
	/// Each slot has its own lock so concurrent requests build at most one
	/// child per slot, without blocking requests for the sibling.
	children: [Mutex<Option<Arc<SnapNode>>>; MAG_FACTOR],
}

/// A spatio-temporal pyramid of tiles over a trace.
///
/// Indexed by `(time, address, depth)`: each level down halves the time
/// and address window of a tile, keeping its pixel count fixed. The top
/// level is built eagerly; everything below on demand. Tile requests may
/// run concurrently.
#[derive(Debug)]
pub struct TileTree<R> {
	/// Trace the tiles are rendered from
	trace: Trace<R>,

	/// Full window covered by the tree.
	///
	/// Covers the trace's duration and address extents, aligned up to
	/// whole top-level tiles.
	span: Span,

	/// Top-level nodes, one per `max_tile_duration` of the span
	trees: Vec<Arc<SnapNode>>,

	/// Number of zoom levels
	height: usize,

	/// Time covered by a top-level tile, in nanoseconds
	max_tile_duration: u64,

	/// Memory covered by a top-level tile, in bytes
	max_tile_mem_chunk: u64,
}

impl<R: ReadAt> TileTree<R> {
	/// Builds the tile tree for `trace`.
	///
	/// Constructs every top-level node, chaining each node's final state
	/// into the next so tiles stay consistent across idle stretches.
	///
	/// # Errors
	/// Returns an error if parsing the trace fails.
	pub fn new(trace: Trace<R>) -> Result<Self, anyhow::Error> {
		let mut max_dur = (trace.duration().as_nanos() as u64).max(MIN_TILE_DURATION);
		let mut min_addr = util::align_down(trace.min_addr(), MIN_TILE_MEM_CHUNK);
		let mut max_addr = util::align_up(trace.max_addr(), MIN_TILE_MEM_CHUNK);
		if max_addr - min_addr < MIN_TILE_MEM_CHUNK {
			max_addr = min_addr + MIN_TILE_MEM_CHUNK;
		}
		let mem_size = max_addr - min_addr;

		// Raise the tile dimensions until they dominate the trace on
		// either axis; the number of doublings is the tree height.
		let mut height = 1;
		let mut max_tile_duration = MIN_TILE_DURATION;
		let mut max_tile_mem_chunk = MIN_TILE_MEM_CHUNK;
		while max_tile_duration < max_dur && max_tile_mem_chunk < mem_size {
			max_tile_duration *= MAG_FACTOR as u64;
			max_tile_mem_chunk *= MAG_FACTOR as u64;
			height += 1;
		}
		max_dur = util::align_up(max_dur, max_tile_duration);
		max_addr = min_addr + util::align_up(max_addr - min_addr, max_tile_mem_chunk);

		tracing::debug!(min_addr, max_addr, max_dur, height, "Building tile tree");

		let mut trees = Vec::with_capacity((max_dur / max_tile_duration) as usize);
		let mut last = None;
		for tree_idx in 0..max_dur / max_tile_duration {
			let min_time = tree_idx * max_tile_duration;
			let (node, node_last) = snap_node_root(&trace, min_time, min_time + max_tile_duration, last.as_ref())?;
			trees.push(Arc::new(node));
			last = Some(node_last);
		}

		Ok(Self {
			trace,
			span: Span {
				min_time: 0,
				max_time: max_dur,
				min_addr,
				max_addr,
			},
			trees,
			height,
			max_tile_duration,
			max_tile_mem_chunk,
		})
	}

	/// Returns the tile at `(time, addr)` and zoom `depth`.
	///
	/// `time` and `addr` must name the exact origin of a tile at that
	/// depth; requests outside the tree's span, or that never line up with
	/// a tile origin, return `Ok(None)`.
	///
	/// # Errors
	/// Returns an error if lazily building a node fails.
	pub fn get_tile(&self, time: Duration, addr: u64, depth: usize) -> Result<Option<TileImage>, anyhow::Error> {
		let time = time.as_nanos() as u64;
		let Span {
			mut min_time,
			mut max_time,
			mut min_addr,
			mut max_addr,
		} = self.span;
		if time < min_time || time >= max_time || addr < min_addr || addr >= max_addr {
			return Ok(None);
		}

		// Narrow to the top-level tile containing the request
		min_addr += (addr - min_addr) / self.max_tile_mem_chunk * self.max_tile_mem_chunk;
		max_addr = min_addr + self.max_tile_mem_chunk;
		min_time += (time - min_time) / self.max_tile_duration * self.max_tile_duration;
		max_time = min_time + self.max_tile_duration;

		let tree_idx = ((min_time - self.span.min_time) / self.max_tile_duration) as usize;
		let mut node = Arc::clone(&self.trees[tree_idx]);
		for cur_depth in 0..self.height {
			if depth == cur_depth && min_time == time && min_addr == addr {
				let mem_chunk = (max_addr - min_addr) / TILE_SIZE as u64;
				return Ok(Some(render_occupancy(&node.snaps, min_addr, max_addr, mem_chunk)));
			}

			// Go one level deeper: halve the window around the request
			let next_mem_chunk = (max_addr - min_addr) / MAG_FACTOR as u64;
			min_addr += (addr - min_addr) / next_mem_chunk * next_mem_chunk;
			max_addr = min_addr + next_mem_chunk;

			let next_duration = (max_time - min_time) / MAG_FACTOR as u64;
			min_time += (time - min_time) / next_duration * next_duration;
			max_time = min_time + next_duration;

			// Children split along time only; zooming in address re-renders
			// the same snapshots over a narrower band.
			let child_idx = ((min_time - node.min_time) / next_duration) as usize;
			let child_snap_idx = child_idx * TILE_SIZE / MAG_FACTOR;
			let child = {
				let mut slot = match node.children[child_idx].lock() {
					Ok(slot) => slot,
					Err(_) => anyhow::bail!("Child slot lock was poisoned"),
				};
				match &*slot {
					Some(child) => Arc::clone(child),
					None => {
						tracing::trace!(min_time, max_time, child_idx, "Building child node");
						let seed = node.snaps[child_snap_idx].as_ref();
						let (child, _) = snap_node_root(&self.trace, min_time, max_time, seed)
							.context("Unable to build child node")?;
						let child = Arc::new(child);
						*slot = Some(Arc::clone(&child));
						child
					},
				}
			};
			node = child;
		}

		Ok(None)
	}

	/// Returns the geometry of this tree
	pub fn info(&self) -> TreeInfo {
		TreeInfo {
			duration:      self.span.max_time,
			min_addr:      self.span.min_addr,
			max_addr:      self.span.max_addr,
			tile_size:     TILE_SIZE as u64,
			min_duration:  MIN_DURATION,
			min_mem_chunk: MIN_MEM_CHUNK,
			max_duration:  self.max_tile_duration,
			max_mem_chunk: self.max_tile_mem_chunk,
			mag_factor:    MAG_FACTOR as u64,
			depth:         self.height as u64,
		}
	}
}

/// Builds a snapshot node covering `[min_time, max_time)` nanoseconds
/// since the trace start, seeded with `start`.
///
/// Also returns the state at the end of the window, for chaining into the
/// following node.
fn snap_node_root<R: ReadAt>(
	trace: &Trace<R>,
	min_time: u64,
	max_time: u64,
	start: Option<&State>,
) -> Result<(SnapNode, State), anyhow::Error> {
	let sliced = trace.slice(Duration::from_nanos(min_time), Duration::from_nanos(max_time));

	// The slice can be clamped short of the window, or empty past the end
	// of the trace; a floor of 1ns keeps the stripper terminating.
	let time_granule = (sliced.duration() / TILE_SIZE as u32).max(Duration::from_nanos(1));
	tracing::trace!(min_time, max_time, ?time_granule, "Building snapshot node");

	let (mut snaps, last) = take_snapshots(&sliced, time_granule, start)?;
	snaps.truncate(TILE_SIZE);
	snaps.resize_with(TILE_SIZE, || None);

	Ok((
		SnapNode {
			min_time,
			max_time,
			snaps,
			children: std::array::from_fn(|_| Mutex::new(None)),
		},
		last,
	))
}

/// Renders snapshot columns into an occupancy image.
///
/// Each column `x` comes from `snaps[x]`; each row covers `mem_chunk`
/// bytes, with the lowest address at the bottom of the image. The address
/// range is aligned up to a whole number of chunks. Missing snapshots
/// render as zero occupancy.
pub fn render_occupancy(snaps: &[Option<State>], min_addr: u64, max_addr: u64, mem_chunk: u64) -> TileImage {
	let max_addr = min_addr + (max_addr - min_addr).div_ceil(mem_chunk) * mem_chunk;
	let width = snaps.len();
	let height = ((max_addr - min_addr) / mem_chunk) as usize;

	let mut pixels = vec![0.0; width * height];
	for (x, snap) in snaps.iter().enumerate() {
		let Some(snap) = snap else { continue };
		for row in 0..height {
			let addr = min_addr + row as u64 * mem_chunk;
			let y = height - 1 - row;
			pixels[y * width + x] = snap.allocated(addr, mem_chunk) as f64 / mem_chunk as f64;
		}
	}

	TileImage { width, height, pixels }
}

/// A rendered tile: a grid of occupancy values in `[0, 1]`.
///
/// Column 0 is the earliest time; row 0 is the top of the image, covering
/// the highest addresses. Zero occupancy renders black; positive values go
/// through the host's colormap.
#[derive(PartialEq, Clone, Debug)]
pub struct TileImage {
	/// Width, in pixels
	width: usize,

	/// Height, in pixels
	height: usize,

	/// Occupancy values, row-major from the top-left
	pixels: Vec<f64>,
}

impl TileImage {
	/// Returns the width of the image, in pixels
	pub fn width(&self) -> usize {
		self.width
	}

	/// Returns the height of the image, in pixels
	pub fn height(&self) -> usize {
		self.height
	}

	/// Returns the occupancy at `(x, y)`
	pub fn occupancy(&self, x: usize, y: usize) -> f64 {
		self.pixels[y * self.width + x]
	}

	/// Returns all occupancy values, row-major from the top-left
	pub fn pixels(&self) -> &[f64] {
		&self.pixels
	}
}

/// Geometry of a [`TileTree`], for hosts to hand to their frontends
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TreeInfo {
	/// Total time covered by the tree, in nanoseconds.
	///
	/// At least the trace duration, aligned up to whole top-level tiles.
	pub duration: u64,

	/// Address window covered by the tree
	pub min_addr: u64,
	pub max_addr: u64,

	/// Pixel columns (and rows) per tile
	pub tile_size: u64,

	/// Time per pixel column at the deepest zoom, in nanoseconds
	pub min_duration: u64,

	/// Memory per pixel row at the deepest zoom, in bytes
	pub min_mem_chunk: u64,

	/// Time per top-level tile, in nanoseconds
	pub max_duration: u64,

	/// Memory per top-level tile, in bytes
	pub max_mem_chunk: u64,

	/// Zoom factor between adjacent depths
	pub mag_factor: u64,

	/// Number of zoom levels
	pub depth: u64,
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{event::PAGE_SIZE, testenc::TraceBuilder},
	};

	/// Builds the tree of a trace with one early allocation and a long
	/// idle tail
	fn single_alloc_tree() -> Result<TileTree<Vec<u8>>, anyhow::Error> {
		let bytes = TraceBuilder::new()
			.pid(0)
			.sync(0)
			.alloc(0x100000, 16, 0)
			.pid(0)
			.sync(1 << 20)
			.finish();
		TileTree::new(Trace::new(bytes)?)
	}

	#[test]
	fn tile_fills_after_allocation() -> Result<(), anyhow::Error> {
		let tree = single_alloc_tree()?;

		let info = tree.info();
		assert_eq!(info.depth, 1);
		assert_eq!(info.min_addr, 0);
		assert_eq!(info.max_addr, MIN_TILE_MEM_CHUNK);
		assert_eq!(info.duration, MIN_TILE_DURATION);

		let tile = tree
			.get_tile(Duration::ZERO, 0, 0)?
			.expect("Origin tile must exist");
		assert_eq!(tile.width(), TILE_SIZE);
		assert_eq!(tile.height(), TILE_SIZE);

		// The allocation covers 16 pages from 0x100000: with one 8KiB chunk
		// per row that's rows 128..144, i.e. y = 112..=127.
		let y = TILE_SIZE - 1 - (0x100000 / MIN_MEM_CHUNK) as usize;
		for x in 1..TILE_SIZE {
			assert_eq!(tile.occupancy(x, y), 1.0, "column {x}");
		}

		// Column 0 is the absent starting state, and rows outside the
		// allocation stay black
		assert_eq!(tile.occupancy(0, y), 0.0);
		assert_eq!(tile.occupancy(10, y + 16), 0.0);
		assert_eq!(tile.occupancy(10, y - 16), 0.0);
		Ok(())
	}

	#[test]
	fn out_of_span_requests_are_not_found() -> Result<(), anyhow::Error> {
		let tree = single_alloc_tree()?;
		let info = tree.info();

		assert!(tree.get_tile(Duration::from_nanos(info.duration), 0, 0)?.is_none());
		assert!(tree.get_tile(Duration::ZERO, info.max_addr, 0)?.is_none());

		// A request that never lines up with a tile origin descends to the
		// bottom and comes back empty
		assert!(tree.get_tile(Duration::from_nanos(1), 0, 0)?.is_none());

		// As does a depth below the tree
		assert!(tree.get_tile(Duration::ZERO, 0, info.depth as usize)?.is_none());
		Ok(())
	}

	#[test]
	fn empty_trace_renders_black() -> Result<(), anyhow::Error> {
		let tree = TileTree::new(Trace::new(vec![])?)?;

		let tile = tree
			.get_tile(Duration::ZERO, 0, 0)?
			.expect("Origin tile must exist");
		assert!(tile.pixels().iter().all(|&occupancy| occupancy == 0.0));
		Ok(())
	}

	/// Builds the tree of a trace long and wide enough for several levels:
	/// a 4MiB address range over a `4 * MIN_TILE_DURATION` window, with the
	/// lower 2MiB allocated plus one page at the very top
	fn deep_tree() -> Result<TileTree<Vec<u8>>, anyhow::Error> {
		let bytes = TraceBuilder::new()
			.pid(0)
			.sync(0)
			.alloc_large(0x400000, (2 << 20) / PAGE_SIZE, 0)
			.alloc(0x800000 - PAGE_SIZE, 1, 128)
			.pid(0)
			.sync(4 * MIN_TILE_DURATION as i64)
			.finish();
		TileTree::new(Trace::new(bytes)?)
	}

	#[test]
	fn deep_tiles_descend_and_chain() -> Result<(), anyhow::Error> {
		let tree = deep_tree()?;

		let info = tree.info();
		assert_eq!(info.depth, 2);
		assert_eq!(info.max_duration, 2 * MIN_TILE_DURATION);
		assert_eq!(info.max_mem_chunk, 2 * MIN_TILE_MEM_CHUNK);
		assert_eq!(info.duration, 4 * MIN_TILE_DURATION);

		// The second top-level tile is seeded from the first one's final
		// state, so the allocation shows from its very first column
		let second = tree
			.get_tile(Duration::from_nanos(info.max_duration), 0x400000, 0)?
			.expect("Tile must exist");
		assert_eq!(second.occupancy(0, TILE_SIZE - 1), 1.0);

		// Zooming one level in lazily builds a child at twice the
		// resolution, still showing the allocation
		let zoomed = tree
			.get_tile(Duration::ZERO, 0x400000, 1)?
			.expect("Tile must exist");
		assert_eq!(zoomed.occupancy(1, TILE_SIZE - 1), 1.0);

		// The upper address half of the window only has the topmost page
		let upper = tree
			.get_tile(Duration::ZERO, 0x400000 + MIN_TILE_MEM_CHUNK, 1)?
			.expect("Tile must exist");
		assert_eq!(upper.occupancy(1, TILE_SIZE - 1), 0.0);
		assert_eq!(upper.occupancy(1, 0), PAGE_SIZE as f64 / MIN_MEM_CHUNK as f64);
		Ok(())
	}

	#[test]
	fn concurrent_requests_agree() -> Result<(), anyhow::Error> {
		let tree = deep_tree()?;

		let (first, second) = std::thread::scope(|s| {
			let first = s.spawn(|| tree.get_tile(Duration::ZERO, 0x400000, 1));
			let second = s.spawn(|| tree.get_tile(Duration::ZERO, 0x400000, 1));
			(first.join().expect("Thread panicked"), second.join().expect("Thread panicked"))
		});

		assert_eq!(first?.expect("Tile must exist"), second?.expect("Tile must exist"));
		Ok(())
	}

	#[test]
	fn render_arbitrary_snapshots() -> Result<(), anyhow::Error> {
		let bytes = TraceBuilder::new()
			.pid(0)
			.sync(0)
			.alloc(0x10000, 2, 0)
			.pid(0)
			.sync(1024)
			.finish();
		let trace = Trace::new(bytes)?;
		let (snaps, _) = take_snapshots(&trace, Duration::from_nanos(128), None)?;

		let image = render_occupancy(&snaps, 0x10000, 0x10000 + 2 * PAGE_SIZE, MIN_MEM_CHUNK);
		assert_eq!(image.height(), 2);
		assert_eq!(image.width(), snaps.len());

		// Lowest address at the bottom
		assert_eq!(image.occupancy(1, 1), 1.0);
		assert_eq!(image.occupancy(1, 0), 1.0);
		Ok(())
	}
}
