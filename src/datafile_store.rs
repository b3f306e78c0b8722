use std::sync::{Arc, RwLock};

use crate::{datafile::Datafile, datafile_reader::DatafileReader};

/// `DatafileStore` holds the current [`DatafileReader`] and allows it to be swapped atomically
/// while other threads keep using the reader they already hold.
pub struct DatafileStore {
    reader: RwLock<Arc<DatafileReader>>,
}

impl DatafileStore {
    pub fn new(datafile: Datafile) -> Self {
        Self {
            reader: RwLock::new(Arc::new(DatafileReader::new(datafile))),
        }
    }

    pub fn get_reader(&self) -> Arc<DatafileReader> {
        // The lock is only poisoned if a writer panicked while holding it. The slot itself is
        // always consistent (a single pointer), so recover the guard instead of crashing.
        match self.reader.read() {
            Ok(reader) => reader.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Install a new datafile, returning the previous reader.
    pub fn set_datafile(&self, datafile: Datafile) -> Arc<DatafileReader> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_reader = Arc::new(DatafileReader::new(datafile));

        let mut slot = match self.reader.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut slot, new_reader)
    }
}
