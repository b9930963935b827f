use nalgebra::zero;

use crate::{
    field_channels::FieldChannels,
    floating_type_mod::FT,
    particle_buffer::{BufferPool, LifeState},
    VF,
};

macro_rules! decl_particle_vec {
    (pub struct $struct_name:ident<const D: usize> { $(pub $field_name:ident: Vec<$field_type:ty> | $default_value:expr),*$(,)?  }) => {
        pub struct $struct_name<const D: usize> {
            $(
                pub $field_name : Vec<$field_type>,
            )*
        }

        impl<const D: usize> $struct_name<D> {
            pub fn len(&self) -> usize {
                self.mass.len()
            }

            pub fn is_empty(&self) -> bool {
                self.mass.is_empty()
            }

            pub fn extend(&mut self, num_elements: usize) {
                $(
                    self.$field_name.extend((0..num_elements).map::<$field_type, _>(|_| $default_value));
                )*
            }

            pub fn copy_particle(&mut self, from: usize, to: usize) {
                $(
                    self.$field_name[to] = self.$field_name[from].clone();
                )*
            }

            pub fn default(len: usize) -> Self {
                Self {
                    $(
                        $field_name: (0..len).map(|_| $default_value).collect::<Vec<$field_type>>(),
                    )*
                }
            }
        }
    }
}

decl_particle_vec! {
    pub struct ParticleVec<const D: usize> {
        pub mass: Vec<FT> | 0.,
        pub volume: Vec<FT> | 0.,
        pub position: Vec<VF<D>> | zero(),
        pub velocity: Vec<VF<D>> | zero(),
        pub density: Vec<FT> | 0.,

        // reference smoothing length divided by the particle's own smoothing length
        pub h_ratio: Vec<FT> | 1.,

        pub life_state: Vec<LifeState> | LifeState::BufferReserved,
    }
}

/**
 * All particles of one body: the core arrays used by the adaptivity, the physics
 * channels of other subsystems and the reserve of buffer slots behind the live
 * particles.
 */
pub struct ParticleBody<const D: usize> {
    pub particles: ParticleVec<D>,
    pub fields: FieldChannels<D>,
    pub buffer: BufferPool,
}

impl<const D: usize> ParticleBody<D> {
    /**
     * Appends `buffer_width` reserved slots to the given particles. Every particle
     * handed in is made `Active`.
     */
    pub fn new(mut particles: ParticleVec<D>, mut fields: FieldChannels<D>, buffer_width: usize) -> Self {
        let num_real_particles = particles.len();
        assert_eq!(
            fields.len(),
            num_real_particles,
            "field channels must have one entry per particle"
        );

        for state in &mut particles.life_state {
            *state = LifeState::Active;
        }

        particles.extend(buffer_width);
        fields.extend(buffer_width);

        ParticleBody {
            particles,
            fields,
            buffer: BufferPool::allocate_reserve(num_real_particles, buffer_width),
        }
    }

    /** Number of slots including retired and reserved ones; indices stay valid for the whole simulation */
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn state_of(&self, i: usize) -> LifeState {
        self.particles.life_state[i]
    }

    pub fn is_live(&self, i: usize) -> bool {
        self.particles.life_state[i].is_live()
    }

    pub fn live_indices(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.is_live(i)).collect()
    }

    pub fn num_live_particles(&self) -> usize {
        self.particles.life_state.iter().filter(|s| s.is_live()).count()
    }

    pub fn total_mass(&self) -> FT {
        (0..self.len()).filter(|&i| self.is_live(i)).map(|i| self.particles.mass[i]).sum()
    }

    pub fn total_volume(&self) -> FT {
        (0..self.len()).filter(|&i| self.is_live(i)).map(|i| self.particles.volume[i]).sum()
    }

    pub fn total_momentum(&self) -> VF<D> {
        (0..self.len())
            .filter(|&i| self.is_live(i))
            .fold(VF::<D>::zeros(), |acc, i| acc + self.particles.velocity[i] * self.particles.mass[i])
    }

    /// Copies every attribute of `from` (core arrays and channels) into the slot `to`.
    pub fn copy_particle(&mut self, from: usize, to: usize) {
        self.particles.copy_particle(from, to);
        self.fields.copy_particle(from, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec2f;

    #[test]
    fn reserve_is_appended_behind_real_particles() {
        let mut particles = ParticleVec::<2>::default(2);
        particles.mass[0] = 1.;
        particles.mass[1] = 2.;
        particles.volume[0] = 1.;
        particles.volume[1] = 1.;
        particles.position[1] = vec2f(1., 0.);
        let fields = FieldChannels::new(2);

        let body = ParticleBody::new(particles, fields, 3);

        assert_eq!(body.len(), 5);
        assert_eq!(body.fields.len(), 5);
        assert_eq!(body.num_live_particles(), 2);
        assert_eq!(body.state_of(0), LifeState::Active);
        assert_eq!(body.state_of(4), LifeState::BufferReserved);
        assert_eq!(body.buffer.capacity(), 3);
        assert_eq!(body.buffer.claim_slot(), Ok(2));
        assert_eq!(body.total_mass(), 3.);
        assert_eq!(body.total_volume(), 2.);
    }
}
