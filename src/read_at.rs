//! Positioned reads

// Imports
use std::io;

/// A byte source supporting positioned reads.
///
/// Unlike [`io::Read`], implementations keep no cursor, so a single source
/// can back several parsers at once through a shared reference.
pub trait ReadAt {
	/// Reads bytes into `buf`, starting at `offset` bytes into the source.
	///
	/// Returns the number of bytes read. Short reads are allowed;
	/// end-of-input is signalled by `Ok(0)`.
	///
	/// # Errors
	/// Returns an error if the underlying source fails to read.
	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, io::Error>;

	/// Reads bytes into `buf` at `offset` until it is full or the source
	/// is exhausted, returning the number of bytes read.
	///
	/// # Errors
	/// Returns an error if the underlying source fails to read.
	fn read_full_at(&self, buf: &mut [u8], mut offset: u64) -> Result<usize, io::Error> {
		let mut read = 0;
		while read < buf.len() {
			match self.read_at(&mut buf[read..], offset) {
				Ok(0) => break,
				Ok(n) => {
					read += n;
					offset += n as u64;
				},
				Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
				Err(err) => return Err(err),
			}
		}

		Ok(read)
	}

	/// Reads exactly `buf.len()` bytes at `offset`.
	///
	/// # Errors
	/// Returns [`io::ErrorKind::UnexpectedEof`] if the source ends before
	/// the buffer is filled, or any error of the underlying source.
	fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<(), io::Error> {
		while !buf.is_empty() {
			match self.read_at(buf, offset) {
				Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
				Ok(n) => {
					let rest = buf;
					buf = &mut rest[n..];
					offset += n as u64;
				},
				Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
				Err(err) => return Err(err),
			}
		}

		Ok(())
	}
}

impl ReadAt for [u8] {
	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, io::Error> {
		let offset = match usize::try_from(offset) {
			Ok(offset) if offset < self.len() => offset,
			_ => return Ok(0),
		};

		let n = buf.len().min(self.len() - offset);
		buf[..n].copy_from_slice(&self[offset..offset + n]);
		Ok(n)
	}
}

impl ReadAt for Vec<u8> {
	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, io::Error> {
		self.as_slice().read_at(buf, offset)
	}
}

impl<R: ReadAt + ?Sized> ReadAt for &R {
	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, io::Error> {
		R::read_at(self, buf, offset)
	}
}

#[cfg(unix)]
impl ReadAt for std::fs::File {
	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, io::Error> {
		std::os::unix::fs::FileExt::read_at(self, buf, offset)
	}
}

#[cfg(windows)]
impl ReadAt for std::fs::File {
	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, io::Error> {
		std::os::windows::fs::FileExt::seek_read(self, buf, offset)
	}
}
