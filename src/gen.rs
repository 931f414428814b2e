//! Random input generation.

use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use rand::Rng;

use crate::chunk::SpillError;
use crate::record::{LineCodec, Record};

/// Generates a record with a uniformly distributed non-negative key.
pub fn random_record<R: Rng + ?Sized>(rng: &mut R) -> Record {
    Record::new(rng.gen_range(0..=i64::MAX), "0")
}

pub fn random_records<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Vec<Record> {
    (0..count).map(|_| random_record(rng)).collect()
}

/// Writes `count` random records to `path`, creating missing parent directories.
pub fn write_random_file<C, R>(
    path: &Path,
    count: u64,
    rng: &mut R,
    codec: &C,
) -> Result<(), SpillError<C::EncodeError>>
where
    C: LineCodec,
    R: Rng + ?Sized,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(SpillError::IO)?;
    }

    let file = fs::File::create(path).map_err(SpillError::IO)?;
    let mut writer = io::BufWriter::with_capacity(100 * 1024, file);
    for _ in 0..count {
        codec
            .encode(&random_record(rng), &mut writer)
            .map_err(SpillError::SerializationError)?;
    }

    writer.flush().map_err(SpillError::IO)
}
