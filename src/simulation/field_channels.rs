/*!
Per-particle physics fields owned by other subsystems (stress, concentration,
transmembrane potential, ...).

The adaptivity code never knows which fields exist. It copies them into split
children and aggregates them on merges through the visitor traits below, so a
new field only has to be registered to take part in splitting and merging.
*/

use std::ops::{Add, Mul};

use crate::{floating_type_mod::FT, VF};

/// Stable handle of a registered channel (its registration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(usize);

/// A single value of any channel type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelSample<const D: usize> {
    Scalar(FT),
    Vector(VF<D>),
}

/// Value types that can be stored in a channel. Linear combinations are all
/// the adaptivity code needs from them.
pub trait ChannelValue<const D: usize>:
    Copy + Send + Sync + Add<Output = Self> + Mul<FT, Output = Self> + 'static
{
    fn zero() -> Self;
    fn into_sample(self) -> ChannelSample<D>;
    fn from_sample(sample: ChannelSample<D>) -> Option<Self>;
}

impl<const D: usize> ChannelValue<D> for FT {
    fn zero() -> Self {
        0.
    }

    fn into_sample(self) -> ChannelSample<D> {
        ChannelSample::Scalar(self)
    }

    fn from_sample(sample: ChannelSample<D>) -> Option<Self> {
        match sample {
            ChannelSample::Scalar(x) => Some(x),
            ChannelSample::Vector(_) => None,
        }
    }
}

impl<const D: usize> ChannelValue<D> for VF<D> {
    fn zero() -> Self {
        VF::<D>::zeros()
    }

    fn into_sample(self) -> ChannelSample<D> {
        ChannelSample::Vector(self)
    }

    fn from_sample(sample: ChannelSample<D>) -> Option<Self> {
        match sample {
            ChannelSample::Vector(v) => Some(v),
            ChannelSample::Scalar(_) => None,
        }
    }
}

pub trait ChannelVisitor<const D: usize> {
    fn visit<T: ChannelValue<D>>(&mut self, id: ChannelId, name: &str, values: &[T]);
}

pub trait ChannelVisitorMut<const D: usize> {
    fn visit_mut<T: ChannelValue<D>>(&mut self, id: ChannelId, name: &str, values: &mut [T]);
}

enum ChannelData<const D: usize> {
    Scalar(Vec<FT>),
    Vector(Vec<VF<D>>),
}

struct FieldChannel<const D: usize> {
    name: String,
    data: ChannelData<D>,
}

pub struct FieldChannels<const D: usize> {
    channels: Vec<FieldChannel<D>>,
    len: usize,
}

impl<const D: usize> FieldChannels<D> {
    pub fn new(len: usize) -> Self {
        FieldChannels {
            channels: Vec::new(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn register_scalar(&mut self, name: &str, default_value: FT) -> ChannelId {
        self.register(name, ChannelData::Scalar(vec![default_value; self.len]))
    }

    pub fn register_vector(&mut self, name: &str, default_value: VF<D>) -> ChannelId {
        self.register(name, ChannelData::Vector(vec![default_value; self.len]))
    }

    fn register(&mut self, name: &str, data: ChannelData<D>) -> ChannelId {
        assert!(
            self.id_of(name).is_none(),
            "field channel '{}' is registered twice",
            name
        );
        self.channels.push(FieldChannel {
            name: name.to_string(),
            data,
        });
        ChannelId(self.channels.len() - 1)
    }

    pub fn id_of(&self, name: &str) -> Option<ChannelId> {
        self.channels.iter().position(|c| c.name == name).map(ChannelId)
    }

    pub fn name(&self, id: ChannelId) -> &str {
        &self.channels[id.0].name
    }

    pub fn scalar(&self, id: ChannelId) -> Option<&[FT]> {
        match &self.channels[id.0].data {
            ChannelData::Scalar(v) => Some(v),
            ChannelData::Vector(_) => None,
        }
    }

    pub fn scalar_mut(&mut self, id: ChannelId) -> Option<&mut [FT]> {
        match &mut self.channels[id.0].data {
            ChannelData::Scalar(v) => Some(v),
            ChannelData::Vector(_) => None,
        }
    }

    pub fn vector(&self, id: ChannelId) -> Option<&[VF<D>]> {
        match &self.channels[id.0].data {
            ChannelData::Vector(v) => Some(v),
            ChannelData::Scalar(_) => None,
        }
    }

    pub fn vector_mut(&mut self, id: ChannelId) -> Option<&mut [VF<D>]> {
        match &mut self.channels[id.0].data {
            ChannelData::Vector(v) => Some(v),
            ChannelData::Scalar(_) => None,
        }
    }

    pub fn get(&self, id: ChannelId, i: usize) -> ChannelSample<D> {
        match &self.channels[id.0].data {
            ChannelData::Scalar(v) => ChannelSample::Scalar(v[i]),
            ChannelData::Vector(v) => ChannelSample::Vector(v[i]),
        }
    }

    /// Returns `false` (and writes nothing) if the sample type does not match the channel.
    pub fn set(&mut self, id: ChannelId, i: usize, sample: ChannelSample<D>) -> bool {
        match (&mut self.channels[id.0].data, sample) {
            (ChannelData::Scalar(v), ChannelSample::Scalar(x)) => {
                v[i] = x;
                true
            }
            (ChannelData::Vector(v), ChannelSample::Vector(x)) => {
                v[i] = x;
                true
            }
            _ => false,
        }
    }

    pub fn visit(&self, visitor: &mut impl ChannelVisitor<D>) {
        for (c, channel) in self.channels.iter().enumerate() {
            match &channel.data {
                ChannelData::Scalar(v) => visitor.visit(ChannelId(c), &channel.name, v.as_slice()),
                ChannelData::Vector(v) => visitor.visit(ChannelId(c), &channel.name, v.as_slice()),
            }
        }
    }

    pub fn visit_mut(&mut self, visitor: &mut impl ChannelVisitorMut<D>) {
        for (c, channel) in self.channels.iter_mut().enumerate() {
            match &mut channel.data {
                ChannelData::Scalar(v) => visitor.visit_mut(ChannelId(c), &channel.name, v.as_mut_slice()),
                ChannelData::Vector(v) => visitor.visit_mut(ChannelId(c), &channel.name, v.as_mut_slice()),
            }
        }
    }

    pub fn extend(&mut self, num_elements: usize) {
        for channel in &mut self.channels {
            match &mut channel.data {
                ChannelData::Scalar(v) => v.extend((0..num_elements).map(|_| 0.)),
                ChannelData::Vector(v) => v.extend((0..num_elements).map(|_| VF::<D>::zeros())),
            }
        }
        self.len += num_elements;
    }

    pub fn copy_particle(&mut self, from: usize, to: usize) {
        struct CopyParticle {
            from: usize,
            to: usize,
        }
        impl<const D: usize> ChannelVisitorMut<D> for CopyParticle {
            fn visit_mut<T: ChannelValue<D>>(&mut self, _id: ChannelId, _name: &str, values: &mut [T]) {
                values[self.to] = values[self.from];
            }
        }

        self.visit_mut(&mut CopyParticle { from, to });
    }
}
