// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::{Cell, RefCell};

use ordered_float::OrderedFloat;
use rand::Rng;

use crate::samplers::{Kernel, SharedRng};

/// A kernel with its scheduling metadata: selection weight plus the step
/// windows inside which it proposes and adapts.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct ScheduledKernel {
    pub kernel: Box<dyn Kernel>,
    #[builder(default = "\"unknown\".to_owned()")]
    pub id: String,
    #[builder(default = "1.0")]
    pub weight: f64,
    #[builder(default = "0")]
    pub adaptation_start: u64,
    #[builder(default = "0")]
    pub adaptation_end: u64,
    #[builder(default = "0")]
    pub update_start: u64,
    #[builder(default = "u64::MAX")]
    pub update_end: u64,
    #[builder(default = "false")]
    pub scaled_adaptation: bool,
}

/// Selects one kernel per draw with probability proportional to its weight.
/// The first step sorts kernels by weight and builds a cumulative table for
/// binary-searched selection.
pub struct RandomizedScheduler {
    rng: SharedRng,
    samples_per_step: usize,
    kernels: RefCell<Vec<ScheduledKernel>>,
    cumulative: RefCell<Vec<f64>>,
    total_weight: Cell<f64>,
    total_steps: Cell<u64>,
    prepared: Cell<bool>,
}

impl RandomizedScheduler {
    pub fn new(rng: &SharedRng, samples_per_step: usize) -> Self {
        RandomizedScheduler {
            rng: rng.clone(),
            samples_per_step,
            kernels: RefCell::new(Vec::new()),
            cumulative: RefCell::new(Vec::new()),
            total_weight: Cell::new(0.0),
            total_steps: Cell::new(0),
            prepared: Cell::new(false),
        }
    }

    pub fn register(&self, kernel: ScheduledKernel) {
        assert!(kernel.weight > 0.0);
        self.total_weight
            .set(self.total_weight.get() + kernel.weight);
        self.kernels.borrow_mut().push(kernel);
        self.prepared.set(false);
    }

    pub fn num_kernels(&self) -> usize {
        self.kernels.borrow().len()
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps.get()
    }

    /// Acceptance statistics per kernel id, for diagnostics.
    pub fn acceptance_report(&self) -> Vec<(String, f64)> {
        self.kernels
            .borrow()
            .iter()
            .map(|entry| (entry.id.clone(), entry.kernel.acceptance_rate()))
            .collect()
    }

    fn prepare(&self) {
        let mut kernels = self.kernels.borrow_mut();
        kernels.sort_by_key(|entry| std::cmp::Reverse(OrderedFloat(entry.weight)));
        let mut cumulative = self.cumulative.borrow_mut();
        cumulative.clear();
        let mut total = 0.0;
        for entry in kernels.iter() {
            total += entry.weight;
            cumulative.push(total);
        }
        self.total_weight.set(total);
        self.prepared.set(true);
    }

    pub fn step(&self) {
        if !self.prepared.get() {
            self.prepare();
        }
        let step = self.total_steps.get();
        for _ in 0..self.samples_per_step {
            let draw: f64 = self.rng.borrow_mut().gen::<f64>() * self.total_weight.get();
            let idx = {
                let cumulative = self.cumulative.borrow();
                cumulative.partition_point(|total| *total <= draw)
            }
            .min(self.num_kernels() - 1);

            let kernels = self.kernels.borrow();
            let entry = &kernels[idx];
            if step >= entry.update_start && step < entry.update_end {
                entry.kernel.update();
            }
            if step >= entry.adaptation_start && step < entry.adaptation_end {
                if entry.scaled_adaptation {
                    entry.kernel.adapt_scaled(step - entry.adaptation_start + 1);
                } else {
                    entry.kernel.adapt();
                }
            }
        }
        self.total_steps.set(step + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;
    use std::rc::Rc;

    struct CountingKernel {
        updates: Rc<StdCell<u32>>,
    }

    impl Kernel for CountingKernel {
        fn update(&self) {
            self.updates.set(self.updates.get() + 1);
        }
        fn acceptances(&self) -> u32 {
            0
        }
        fn rejections(&self) -> u32 {
            0
        }
        fn identifier(&self) -> String {
            "CountingKernel".to_owned()
        }
    }

    #[test]
    fn selection_follows_weights() {
        use rand::SeedableRng;
        let rng: SharedRng = Rc::new(RefCell::new(rand::rngs::StdRng::seed_from_u64(3)));
        let scheduler = RandomizedScheduler::new(&rng, 1);

        let heavy = Rc::new(StdCell::new(0));
        let light = Rc::new(StdCell::new(0));
        scheduler.register(
            ScheduledKernelBuilder::default()
                .kernel(Box::new(CountingKernel {
                    updates: heavy.clone(),
                }) as Box<dyn Kernel>)
                .id("heavy".to_owned())
                .weight(9.0)
                .build()
                .unwrap(),
        );
        scheduler.register(
            ScheduledKernelBuilder::default()
                .kernel(Box::new(CountingKernel {
                    updates: light.clone(),
                }) as Box<dyn Kernel>)
                .id("light".to_owned())
                .weight(1.0)
                .build()
                .unwrap(),
        );

        for _ in 0..2000 {
            scheduler.step();
        }
        let heavy_share = heavy.get() as f64 / 2000.0;
        assert!(heavy_share > 0.85 && heavy_share < 0.95);
        assert_eq!(heavy.get() + light.get(), 2000);
    }

    #[test]
    fn update_windows_gate_kernels() {
        use rand::SeedableRng;
        let rng: SharedRng = Rc::new(RefCell::new(rand::rngs::StdRng::seed_from_u64(3)));
        let scheduler = RandomizedScheduler::new(&rng, 1);
        let updates = Rc::new(StdCell::new(0));
        scheduler.register(
            ScheduledKernelBuilder::default()
                .kernel(Box::new(CountingKernel {
                    updates: updates.clone(),
                }) as Box<dyn Kernel>)
                .update_start(10)
                .update_end(20)
                .build()
                .unwrap(),
        );
        for _ in 0..30 {
            scheduler.step();
        }
        assert_eq!(updates.get(), 10);
    }
}
