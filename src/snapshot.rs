//! Snapshot stripping

// Imports
use {
	crate::{
		read_at::ReadAt,
		sim::{Simulator, State},
		Parser, Trace,
	},
	anyhow::Context,
	std::time::Duration,
};

/// Drives a parser over `trace` and captures a state snapshot every
/// `time_granule`.
///
/// `snaps[i]` is the state of the address space as of
/// `trace.time_start() + i * time_granule`; `snaps[0]` is the provided
/// starting state, which seeds the simulator and may be `None`. Idle
/// periods repeat the state preceding them, and the sequence is padded
/// with the final state until it spans the trace's duration. That final
/// state is also returned on its own, for chaining into a following
/// slice.
///
/// # Errors
/// Returns an error if `time_granule` is zero, or if parsing fails.
pub fn take_snapshots<R: ReadAt>(
	trace: &Trace<R>,
	time_granule: Duration,
	start: Option<&State>,
) -> Result<(Vec<Option<State>>, State), anyhow::Error> {
	anyhow::ensure!(!time_granule.is_zero(), "time granule must be non-zero");

	let mut parser = Parser::new(trace);
	let mut sim = Simulator::new();
	if let Some(start) = start {
		sim.set_state(start);
	}

	let mut snaps = vec![start.cloned()];
	let mut last_snap_time = trace.time_start();
	loop {
		let Some(event) = parser.next().context("Unable to parse next event")? else {
			break;
		};

		// Snapshot every granule crossed up to this event, so idle periods
		// fill with repeats of the state preceding them.
		while event.time.saturating_sub(last_snap_time) > time_granule {
			snaps.push(Some(sim.snapshot().clone()));
			last_snap_time += time_granule;
		}

		sim.feed(event);
	}

	let last = sim.snapshot().clone();
	while trace.time_start() + time_granule * (snaps.len() as u32) < trace.time_end() {
		snaps.push(Some(last.clone()));
	}

	Ok((snaps, last))
}
