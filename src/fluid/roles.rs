use crate::{FluidError, Result};

/// Index into the solver's fixed field arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot(pub usize);

pub const VELOCITY: Slot = Slot(0);
pub const PRESSURE: Slot = Slot(1);
pub const SCRATCH: [Slot; 2] = [Slot(2), Slot(3)];
pub const ARENA_SIZE: usize = 4;

/// Which arena slot currently plays which part in a frame. Stages write into
/// `free1` and then swap it with the quantity they updated, so no field is
/// ever read and written by the same dispatch and nothing is copied.
///
/// A stage whose result must outlive the next stage (divergence through the
/// pressure solve, gradient through the velocity update) holds `free1`;
/// `free2` then steps in as the only free slot until the field is recycled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRoles {
    pub velocity: Slot,
    pub pressure: Slot,
    pub free1: Slot,
    pub free2: Option<Slot>,
}

impl Default for FieldRoles {
    fn default() -> Self {
        Self {
            velocity: VELOCITY,
            pressure: PRESSURE,
            free1: SCRATCH[0],
            free2: Some(SCRATCH[1]),
        }
    }
}

impl FieldRoles {
    pub fn swap_velocity(&mut self) {
        std::mem::swap(&mut self.velocity, &mut self.free1);
        self.debug_check();
    }
    pub fn swap_pressure(&mut self) {
        std::mem::swap(&mut self.pressure, &mut self.free1);
        self.debug_check();
    }
    /// Takes `free1` out of circulation. `free2` becomes `free1`.
    pub fn hold(&mut self) -> Result<Slot> {
        let next = self.free2.take().ok_or_else(|| {
            FluidError::InvalidState("no scratch field left to hold".to_string())
        })?;
        let held = std::mem::replace(&mut self.free1, next);
        self.debug_check();
        Ok(held)
    }
    /// Returns a held slot to the free pool.
    pub fn recycle(&mut self, slot: Slot) -> Result<()> {
        if self.free2.is_some() {
            return Err(FluidError::InvalidState(format!(
                "{:?} recycled while no field was held",
                slot
            )));
        }
        let candidate = Self {
            free2: Some(slot),
            ..self.clone()
        };
        if !candidate.is_distinct() {
            return Err(FluidError::InvalidState(format!(
                "{:?} recycled while still in use",
                slot
            )));
        }
        *self = candidate;
        Ok(())
    }
    /// The copies that bring velocity and pressure back to their own slots,
    /// in an order where no copy overwrites what a later one still reads.
    /// Resets the roles to their defaults.
    pub fn copy_back(&mut self) -> Vec<(Slot, Slot)> {
        let mut copies = Vec::with_capacity(3);
        if self.velocity == PRESSURE && self.pressure == VELOCITY {
            // crossed: park pressure in scratch first
            copies.push((self.pressure, self.free1));
            self.swap_pressure();
        }
        let velocity = (self.velocity != VELOCITY).then_some((self.velocity, VELOCITY));
        let pressure = (self.pressure != PRESSURE).then_some((self.pressure, PRESSURE));
        if self.pressure == VELOCITY {
            copies.extend(pressure);
            copies.extend(velocity);
        } else {
            copies.extend(velocity);
            copies.extend(pressure);
        }
        *self = Self::default();
        copies
    }
    pub fn is_distinct(&self) -> bool {
        let mut seen = [false; ARENA_SIZE];
        let slots = [Some(self.velocity), Some(self.pressure), Some(self.free1), self.free2];
        for Slot(i) in slots.into_iter().flatten() {
            if i >= ARENA_SIZE || seen[i] {
                return false;
            }
            seen[i] = true;
        }
        true
    }
    fn debug_check(&self) {
        debug_assert!(self.is_distinct(), "field roles alias: {:?}", self);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn swaps_move_the_quantity_into_scratch() {
        let mut roles = FieldRoles::default();
        roles.swap_velocity();
        assert_eq!(roles.velocity, SCRATCH[0]);
        assert_eq!(roles.free1, VELOCITY);
        roles.swap_pressure();
        assert_eq!(roles.pressure, VELOCITY);
        assert_eq!(roles.free1, PRESSURE);
        assert!(roles.is_distinct());
    }

    #[test]
    fn hold_and_recycle() {
        let mut roles = FieldRoles::default();
        let divergence = roles.hold().unwrap();
        assert_eq!(divergence, SCRATCH[0]);
        assert_eq!(roles.free1, SCRATCH[1]);
        assert!(matches!(roles.hold(), Err(FluidError::InvalidState(_))));
        roles.recycle(divergence).unwrap();
        assert_eq!(roles, FieldRoles {
            free1: SCRATCH[1],
            free2: Some(SCRATCH[0]),
            ..Default::default()
        });
        assert!(roles.recycle(divergence).is_err());
    }

    #[test]
    fn copy_back_never_clobbers_a_pending_source() {
        for v in 0..ARENA_SIZE {
            for p in (0..ARENA_SIZE).filter(|p| *p != v) {
                for f1 in (0..ARENA_SIZE).filter(|f| *f != v && *f != p) {
                    let f2 = 6 - v - p - f1;
                    let mut roles = FieldRoles {
                        velocity: Slot(v),
                        pressure: Slot(p),
                        free1: Slot(f1),
                        free2: Some(Slot(f2)),
                    };
                    let mut arena = ['x'; ARENA_SIZE];
                    arena[v] = 'v';
                    arena[p] = 'p';
                    for (Slot(from), Slot(to)) in roles.copy_back() {
                        assert_ne!(from, to);
                        arena[to] = arena[from];
                    }
                    assert_eq!(arena[VELOCITY.0], 'v', "{:?}", (v, p, f1));
                    assert_eq!(arena[PRESSURE.0], 'p', "{:?}", (v, p, f1));
                    assert_eq!(roles, FieldRoles::default());
                }
            }
        }
    }

    #[test]
    fn crossed_roles_go_through_scratch() {
        let mut roles = FieldRoles {
            velocity: PRESSURE,
            pressure: VELOCITY,
            ..Default::default()
        };
        assert_eq!(
            roles.copy_back(),
            vec![(VELOCITY, SCRATCH[0]), (PRESSURE, VELOCITY), (SCRATCH[0], PRESSURE)]
        );
        assert!(FieldRoles::default().copy_back().is_empty());
    }

    #[test]
    fn recycling_a_live_slot_is_rejected() {
        let mut roles = FieldRoles::default();
        let _held = roles.hold().unwrap();
        assert!(matches!(
            roles.recycle(VELOCITY),
            Err(FluidError::InvalidState(_))
        ));
    }
}
