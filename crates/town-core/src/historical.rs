//! Change sampling over a game table whose records carry tracked numeric
//! fields. Each tick the sampler compares tracked fields of modified rows
//! against their last recorded values; each flush packs the accumulated
//! samples into the record's history blob.

use std::collections::BTreeMap;

use contracts::history::{self, FieldHistory, HistorySample};
use contracts::Id;

use crate::game_table::{GameRecord, GameTable, TableError, TableFlush};

pub trait HistoricalRecord: GameRecord {
    /// Names of the sampled fields, in the order the blob lists them.
    const TRACKED_FIELDS: &'static [&'static str];

    fn tracked_value(&self, field: &str) -> f64;

    fn set_history(&mut self, blob: Vec<u8>);
}

#[derive(Debug)]
pub struct HistoricalTable<T: HistoricalRecord> {
    table: GameTable<T>,
    /// Per record, per field: changes observed since the last flush.
    buffers: BTreeMap<Id, BTreeMap<String, Vec<HistorySample>>>,
    /// Per record, per field: the value as of the last sample or flush.
    known_values: BTreeMap<Id, BTreeMap<String, f64>>,
}

impl<T: HistoricalRecord> Default for HistoricalTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: HistoricalRecord> HistoricalTable<T> {
    pub fn new() -> Self {
        Self {
            table: GameTable::new(),
            buffers: BTreeMap::new(),
            known_values: BTreeMap::new(),
        }
    }

    pub fn hydrate(rows: impl IntoIterator<Item = T>) -> Self {
        let mut this = Self::new();
        let table = GameTable::hydrate(rows);
        for doc in table.iter_all() {
            this.known_values
                .insert(doc.id().to_string(), Self::field_values(doc));
        }
        this.table = table;
        this
    }

    fn field_values(doc: &T) -> BTreeMap<String, f64> {
        T::TRACKED_FIELDS
            .iter()
            .map(|field| ((*field).to_string(), doc.tracked_value(field)))
            .collect()
    }

    pub fn insert(&mut self, row: T) -> Id {
        let values = Self::field_values(&row);
        let id = self.table.insert(row);
        self.known_values.insert(id.clone(), values);
        id
    }

    pub fn delete(&mut self, id: &str) {
        self.table.delete(id);
        self.buffers.remove(id);
        self.known_values.remove(id);
    }

    pub fn lookup(&self, id: &str) -> Result<&T, TableError> {
        self.table.lookup(id)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.table.get(id)
    }

    pub fn update<R>(&mut self, id: &str, f: impl FnOnce(&mut T) -> R) -> Result<R, TableError> {
        self.table.update(id, f)
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &T> {
        self.table.iter_active()
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &T> {
        self.table.iter_all()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Record `(now, value)` for every tracked field of a modified record
    /// whose value moved since its last sample. Runs once per tick, after
    /// the world rules have written.
    pub fn sample_tick(&mut self, now: f64) {
        let modified: Vec<Id> = self.table.modified_ids().cloned().collect();
        for id in modified {
            let Some(doc) = self.table.get(&id) else {
                continue;
            };
            let known = self.known_values.entry(id.clone()).or_default();
            for field in T::TRACKED_FIELDS {
                let current = doc.tracked_value(field);
                let previous = known.get(*field).copied();
                if previous == Some(current) {
                    continue;
                }
                known.insert((*field).to_string(), current);
                self.buffers
                    .entry(id.clone())
                    .or_default()
                    .entry((*field).to_string())
                    .or_default()
                    .push(HistorySample {
                        time: now,
                        value: current,
                    });
            }
        }
    }

    /// Pack accumulated samples into each record's history blob, then drain
    /// the underlying table's write set. Buffers reset for the next
    /// interval; the interval's opening value for a field is its first
    /// sample's value, or the current value when the field never moved.
    pub fn save(&mut self) -> TableFlush<T> {
        let sampled: Vec<Id> = self.buffers.keys().cloned().collect();
        for id in sampled {
            let Some(doc) = self.table.get(&id) else {
                self.buffers.remove(&id);
                continue;
            };

            let mut fields = BTreeMap::new();
            let buffered = self.buffers.remove(&id).unwrap_or_default();
            for field in T::TRACKED_FIELDS {
                let samples = buffered.get(*field).cloned().unwrap_or_default();
                let initial_value = samples
                    .first()
                    .map(|sample| sample.value)
                    .unwrap_or_else(|| doc.tracked_value(field));
                fields.insert(
                    (*field).to_string(),
                    FieldHistory {
                        initial_value,
                        samples,
                    },
                );
            }

            // Field names are short and few; packing cannot fail here.
            if let Ok(blob) = history::pack(&fields) {
                let _ = self.table.update_any(&id, |doc| doc.set_history(blob));
            }
        }

        self.table.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Probe {
        id: Id,
        x: f64,
        y: f64,
        history: Option<Vec<u8>>,
    }

    impl GameRecord for Probe {
        fn id(&self) -> &str {
            &self.id
        }
    }

    impl HistoricalRecord for Probe {
        const TRACKED_FIELDS: &'static [&'static str] = &["x", "y"];

        fn tracked_value(&self, field: &str) -> f64 {
            match field {
                "x" => self.x,
                "y" => self.y,
                _ => 0.0,
            }
        }

        fn set_history(&mut self, blob: Vec<u8>) {
            self.history = Some(blob);
        }
    }

    #[test]
    fn changed_field_samples_and_unchanged_field_stays_flat() {
        let mut table = HistoricalTable::hydrate([Probe {
            id: "probes:1".to_string(),
            x: 9.0,
            y: 7.0,
            history: None,
        }]);

        for (tick, value) in [(1.0, 10.0), (3.0, 11.0), (5.0, 12.0)] {
            table.update("probes:1", |p| p.x = value).expect("update");
            table.sample_tick(tick);
        }

        let flush = table.save();
        assert_eq!(flush.replaced.len(), 1);
        let blob = flush.replaced[0].history.clone().expect("history set");
        let fields = history::unpack(&blob).expect("unpack");

        let x = &fields["x"];
        assert_eq!(x.initial_value, 10.0);
        assert_eq!(
            x.samples,
            vec![
                HistorySample {
                    time: 1.0,
                    value: 10.0
                },
                HistorySample {
                    time: 3.0,
                    value: 11.0
                },
                HistorySample {
                    time: 5.0,
                    value: 12.0
                },
            ]
        );

        let y = &fields["y"];
        assert_eq!(y.initial_value, 7.0);
        assert!(y.samples.is_empty());
    }

    #[test]
    fn sampling_only_fires_on_value_movement() {
        let mut table = HistoricalTable::hydrate([Probe {
            id: "probes:1".to_string(),
            x: 1.0,
            y: 1.0,
            history: None,
        }]);

        // Touch the record without moving tracked values.
        table.update("probes:1", |_| {}).expect("touch");
        table.sample_tick(16.0);

        let flush = table.save();
        assert_eq!(flush.replaced.len(), 1);
        assert!(flush.replaced[0].history.is_none());
    }

    #[test]
    fn buffers_reset_between_flushes() {
        let mut table = HistoricalTable::hydrate([Probe {
            id: "probes:1".to_string(),
            x: 0.0,
            y: 0.0,
            history: None,
        }]);

        table.update("probes:1", |p| p.x = 1.0).expect("update");
        table.sample_tick(16.0);
        table.save();

        table.update("probes:1", |p| p.x = 2.0).expect("update");
        table.sample_tick(32.0);
        let flush = table.save();

        let blob = flush.replaced[0].history.clone().expect("history");
        let fields = history::unpack(&blob).expect("unpack");
        assert_eq!(fields["x"].samples.len(), 1);
        assert_eq!(fields["x"].samples[0].time, 32.0);
    }
}
