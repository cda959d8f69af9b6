//! For one key, the values extracted for it and the set of file ids each
//! value came from.

use roaring::RoaringBitmap;
use smallvec::SmallVec;

use crate::codec::{read_varint, write_varint, DataCodec, ValueCodec};
use crate::{FileId, Result};
use std::sync::Arc;

/// Most keys carry a single distinct value, so the one-entry case stays
/// inline.
#[derive(Debug, Clone)]
pub struct ValueContainer<V> {
    entries: SmallVec<[(V, RoaringBitmap); 1]>,
}

impl<V> Default for ValueContainer<V> {
    fn default() -> ValueContainer<V> {
        ValueContainer { entries: SmallVec::new() }
    }
}

impl<V: Clone + PartialEq> ValueContainer<V> {
    pub fn new() -> ValueContainer<V> {
        ValueContainer::default()
    }

    /// Associates `input` with `value`, merging with an existing identical
    /// value.
    pub fn add(&mut self, input: FileId, value: V) {
        match self.entries.iter_mut().find(|(existing, _)| *existing == value) {
            Some((_, inputs)) => {
                inputs.insert(input);
            }
            None => {
                let mut inputs = RoaringBitmap::new();
                inputs.insert(input);
                self.entries.push((value, inputs));
            }
        }
    }

    /// Drops every association of `input`; returns whether anything changed.
    pub fn remove_input(&mut self, input: FileId) -> bool {
        let mut changed = false;
        self.entries.retain(|(_, inputs)| {
            changed |= inputs.remove(input);
            !inputs.is_empty()
        });
        changed
    }

    pub fn inputs_for(&self, value: &V) -> Option<&RoaringBitmap> {
        self.entries.iter().find(|(existing, _)| existing == value).map(|(_, inputs)| inputs)
    }

    /// The union of every value's input set.
    pub fn all_inputs(&self) -> RoaringBitmap {
        self.entries.iter().map(|(_, inputs)| inputs).fold(RoaringBitmap::new(), |acc, b| acc | b)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&V, &RoaringBitmap)> {
        self.entries.iter().map(|(value, inputs)| (value, inputs))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serializes a whole container: a varint entry count, then per entry the
/// value through the extension codec followed by the input bitmap in the
/// standard roaring format.
pub struct ValueContainerCodec<V> {
    values: Arc<dyn ValueCodec<V>>,
}

impl<V> ValueContainerCodec<V> {
    pub fn new(values: Arc<dyn ValueCodec<V>>) -> ValueContainerCodec<V> {
        ValueContainerCodec { values }
    }
}

impl<V: Clone + PartialEq + Send + Sync> DataCodec<ValueContainer<V>> for ValueContainerCodec<V> {
    fn encode(&self, container: &ValueContainer<V>, out: &mut Vec<u8>) -> Result<()> {
        write_varint(out, container.entries.len() as u64);
        for (value, inputs) in container.iter() {
            self.values.write(value, out)?;
            inputs.serialize_into(&mut *out)?;
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<ValueContainer<V>> {
        let mut input = bytes;
        let count = read_varint(&mut input)? as usize;
        let mut entries = SmallVec::with_capacity(count);
        for _ in 0..count {
            let value = self.values.read(&mut input)?;
            let inputs = RoaringBitmap::deserialize_from(&mut input)?;
            entries.push((value, inputs));
        }
        Ok(ValueContainer { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::I32Codec;

    #[test]
    fn identical_values_share_one_entry() {
        let mut container = ValueContainer::new();
        container.add(1, 7);
        container.add(2, 7);
        container.add(3, 9);

        assert_eq!(container.len(), 2);
        let sevens = container.inputs_for(&7).unwrap();
        assert!(sevens.contains(1) && sevens.contains(2));
        assert_eq!(container.all_inputs().len(), 3);
    }

    #[test]
    fn removing_the_last_input_drops_the_value() {
        let mut container = ValueContainer::new();
        container.add(1, 7);
        container.add(2, 9);

        assert!(container.remove_input(1));
        assert!(container.inputs_for(&7).is_none());
        assert!(!container.remove_input(1));
        assert!(container.remove_input(2));
        assert!(container.is_empty());
    }

    #[test]
    fn codec_keeps_value_to_input_associations() {
        let mut container = ValueContainer::new();
        container.add(10, 7);
        container.add(11, 7);
        container.add(12, -3);

        let codec = ValueContainerCodec::new(Arc::new(I32Codec));
        let mut bytes = Vec::new();
        codec.encode(&container, &mut bytes).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.inputs_for(&7), container.inputs_for(&7));
        assert_eq!(decoded.inputs_for(&-3), container.inputs_for(&-3));
    }
}
