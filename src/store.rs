use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;
use crate::ERR;

/// Rows keyed by id, each behind its own lock.
///
/// The table lock is only held long enough to find or insert a row handle. Callers then lock
/// the row itself, so two operations on different rows never wait on each other and two
/// operations on the same row are serialized.
pub struct Table<T> {
   rows: RwLock<BTreeMap<String, Arc<Mutex<T>>>>,
}

impl<T> Default for Table<T> {
   fn default() -> Self {
      return Table { rows: RwLock::new(BTreeMap::new()) };
   }
}

impl<T> Table<T> {
   pub fn new() -> Self { return Table::default() }

   /// # Errors
   /// `Conflict` if `id` is already taken.
   pub fn insert_new(&self, id: &str, row: T) -> Result<Arc<Mutex<T>>> {
      let mut rows = self.rows.write();
      if rows.contains_key(id) {
         return Err(ERR!(Conflict, "'{id}' already exists"));
      }
      let handle = Arc::new(Mutex::new(row));
      rows.insert(id.to_string(), handle.clone());
      return Ok(handle);
   }

   pub fn get(&self, id: &str) -> Option<Arc<Mutex<T>>> {
      return self.rows.read().get(id).cloned();
   }

   /// Like [`Table::get`] but `NotFound` names the missing `kind`.
   pub fn require(&self, kind: &str, id: &str) -> Result<Arc<Mutex<T>>> {
      return self.get(id).ok_or_else(|| ERR!(NotFound, "{kind} '{id}' does not exist"));
   }

   pub fn contains(&self, id: &str) -> bool {
      return self.rows.read().contains_key(id);
   }

   /// Handles to every row in id order. The table lock is released before returning.
   pub fn handles(&self) -> Vec<Arc<Mutex<T>>> {
      return self.rows.read().values().cloned().collect();
   }

   pub fn len(&self) -> usize { return self.rows.read().len() }

   pub fn is_empty(&self) -> bool { return self.len() == 0 }
}

impl<T: Clone> Table<T> {
   /// Copy every row out, locking one row at a time.
   pub fn export(&self) -> Vec<T> {
      return self.handles().iter().map(|row| row.lock().clone()).collect();
   }

   pub fn from_rows(rows: impl IntoIterator<Item = (String, T)>) -> Self {
      let rows = rows
         .into_iter()
         .map(|(id, row)| (id, Arc::new(Mutex::new(row))))
         .collect();
      return Table { rows: RwLock::new(rows) };
   }
}

/// Write `value` to `path` with bincode.
pub fn write_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<()> {
   let file = File::create(path)
      .map_err(|err| ERR!(Storage, "could not create {}: {err}", path.display()))?;
   bincode::serialize_into(BufWriter::new(file), value)?;
   return Ok(());
}

/// Read a value written by [`write_snapshot`].
pub fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<T> {
   let file = File::open(path)
      .map_err(|err| ERR!(Storage, "could not open {}: {err}", path.display()))?;
   return Ok(bincode::deserialize_from(BufReader::new(file))?);
}
