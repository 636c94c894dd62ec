use crate::{device::DeviceLimits, FluidError, Result};

/// Work partition for one dispatch. `global` is the grid size rounded up
/// to whole work groups, so kernels must skip cells outside the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchPlan {
    pub global: [usize; 2],
    pub local: [usize; 2],
}

impl DispatchPlan {
    pub fn groups(&self) -> [usize; 2] {
        [
            self.global[0] / self.local[0],
            self.global[1] / self.local[1],
        ]
    }
    /// Checks the work group shape against what the device can run.
    pub fn validate(&self, limits: &DeviceLimits) -> std::result::Result<(), String> {
        let size = self.local[0] * self.local[1];
        if size > limits.max_work_group_size {
            return Err(format!(
                "work group {} x {} = {} exceeds the device maximum",
                self.local[0], self.local[1], size
            ));
        }
        let groups = self.groups();
        for axis in 0..2 {
            if self.local[axis] > limits.max_work_item_sizes[axis] {
                return Err(format!(
                    "work group dimension {} is {} but the device allows {}",
                    axis, self.local[axis], limits.max_work_item_sizes[axis]
                ));
            }
            if groups[axis] > limits.max_work_groups_per_dimension {
                return Err(format!(
                    "{} work groups along dimension {}, the device allows {}",
                    groups[axis], axis, limits.max_work_groups_per_dimension
                ));
            }
        }
        Ok(())
    }
}

/// Smallest multiple of `factor` that is >= `value`.
pub fn next_multiple(value: usize, factor: usize) -> usize {
    match value % factor {
        0 => value,
        r => value + (factor - r),
    }
}

/// Splits `n` into `f1 * f2` with the factors as close as the prime
/// factorization allows: primes are taken in ascending order and dealt out
/// alternately, starting with `f1`.
pub fn factor_evenly(n: usize) -> (usize, usize) {
    debug_assert!(n > 0);
    let mut factors = [1usize, 1usize];
    let mut turn = 0;
    let mut rest = n;
    let mut p = 2;
    while rest > 1 {
        if rest % p == 0 {
            factors[turn] *= p;
            turn ^= 1;
            rest /= p;
        } else {
            p += 1;
        }
    }
    (factors[0], factors[1])
}

pub fn plan_dispatch(width: u32, height: u32, preferred_group_size: usize) -> Result<DispatchPlan> {
    if preferred_group_size == 0 {
        return Err(FluidError::DeviceQuery(
            "device reported a work group size of 0".to_string(),
        ));
    }
    if width == 0 || height == 0 {
        return Err(FluidError::InvalidConfig(format!(
            "cannot dispatch over a {}x{} grid",
            width, height
        )));
    }
    let (g1, g2) = factor_evenly(preferred_group_size);
    Ok(DispatchPlan {
        global: [
            next_multiple(width as usize, g1),
            next_multiple(height as usize, g2),
        ],
        local: [g1, g2],
    })
}

/// One-dimensional plan over `count` items, padded to whole work groups.
pub fn plan_linear(count: usize, preferred_group_size: usize) -> Result<DispatchPlan> {
    if preferred_group_size == 0 {
        return Err(FluidError::DeviceQuery(
            "device reported a work group size of 0".to_string(),
        ));
    }
    if count == 0 {
        return Err(FluidError::InvalidConfig(
            "cannot dispatch over zero items".to_string(),
        ));
    }
    Ok(DispatchPlan {
        global: [next_multiple(count, preferred_group_size), 1],
        local: [preferred_group_size, 1],
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn factors_are_as_square_as_primes_allow() {
        assert_eq!(factor_evenly(1), (1, 1));
        assert_eq!(factor_evenly(64), (8, 8));
        assert_eq!(factor_evenly(256), (16, 16));
        assert_eq!(factor_evenly(128), (16, 8));
        assert_eq!(factor_evenly(12), (6, 2));
        assert_eq!(factor_evenly(13), (13, 1));
    }

    #[test]
    fn factoring_is_exact_up_to_1024() {
        for n in 1..=1024 {
            let (f1, f2) = factor_evenly(n);
            assert_eq!(f1 * f2, n, "{}", n);
        }
    }

    #[test]
    fn rejects_shapes_the_device_cannot_run() {
        let plan = plan_dispatch(64, 64, 128).unwrap();
        assert_eq!(plan.local, [16, 8]);
        let cpu = DeviceLimits {
            max_work_group_size: 256,
            max_work_item_sizes: [256, 1, 1],
            max_work_groups_per_dimension: 65535,
        };
        assert!(plan.validate(&cpu).is_err());
        let gpu = DeviceLimits {
            max_work_group_size: 256,
            max_work_item_sizes: [256, 256, 64],
            max_work_groups_per_dimension: 65535,
        };
        assert!(plan.validate(&gpu).is_ok());
        assert_eq!(plan.groups(), [4, 8]);
        let few_groups = DeviceLimits {
            max_work_groups_per_dimension: 4,
            ..gpu
        };
        assert!(plan.validate(&few_groups).is_err());
        assert!(matches!(
            plan_dispatch(8, 8, 0),
            Err(FluidError::DeviceQuery(_))
        ));
    }

    #[test]
    fn linear_plans_pad_to_whole_groups() {
        let plan = plan_linear(15, 64).unwrap();
        assert_eq!(plan.global, [64, 1]);
        assert_eq!(plan.local, [64, 1]);
        assert_eq!(plan.groups(), [1, 1]);
        assert_eq!(plan_linear(128, 64).unwrap().groups(), [2, 1]);
        let cpu = DeviceLimits {
            max_work_group_size: 256,
            max_work_item_sizes: [256, 1, 1],
            max_work_groups_per_dimension: 65535,
        };
        assert!(plan_linear(10_000, 128).unwrap().validate(&cpu).is_ok());
        assert!(plan_linear(0, 64).is_err());
    }

    proptest! {
        #[test]
        fn padded_size_covers_the_grid(w in 1u32..600, h in 1u32..600, n in 1usize..=1024) {
            let plan = plan_dispatch(w, h, n).unwrap();
            prop_assert_eq!(plan.local[0] * plan.local[1], n);
            prop_assert!(plan.global[0] >= w as usize);
            prop_assert!(plan.global[1] >= h as usize);
            prop_assert_eq!(plan.global[0] % plan.local[0], 0);
            prop_assert_eq!(plan.global[1] % plan.local[1], 0);
            prop_assert!(plan.global[0] - (w as usize) < plan.local[0]);
        }
    }
}
