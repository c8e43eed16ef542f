use std::time::Duration;

use proptest::prelude::*;
use foldwise_core::llm::{BackendKind, ProviderDescriptor};
use foldwise_core::{ModelScheduler, SchedulerConfig};

#[derive(Clone, Debug)]
enum Op {
    Load { model: usize, force: bool },
    Unload(usize),
    Touch(usize),
}

fn op(models: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..models, any::<bool>()).prop_map(|(model, force)| Op::Load { model, force }),
        (0..models).prop_map(Op::Unload),
        (0..models).prop_map(Op::Touch),
    ]
}

fn models(sizes: &[f64]) -> Vec<ProviderDescriptor> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, ram)| ProviderDescriptor::new(BackendKind::Ollama, format!("model-{i}"), *ram))
        .collect()
}

proptest! {
    #[test]
    fn residency_never_exceeds_budget(
        sizes in prop::collection::vec(1u8..=12, 1..6),
        max_concurrent in 1usize..4,
        ops in prop::collection::vec(op(6), 1..40),
    ) {
        let total = 16.0;
        let sizes: Vec<f64> = sizes.into_iter().map(f64::from).collect();
        let descriptors = models(&sizes);
        let scheduler = ModelScheduler::new(SchedulerConfig {
            total_ram_gb: total,
            max_concurrent,
            idle_timeout: Duration::from_secs(3600),
        });
        for desc in &descriptors {
            scheduler.register(desc);
        }
        for op in ops {
            match op {
                Op::Load { model, force } => {
                    let Some(desc) = descriptors.get(model) else { continue };
                    let outcome = scheduler.load(&desc.name, force);
                    if force {
                        prop_assert!(outcome.is_ok(), "forced load of a fitting model failed: {:?}", outcome);
                    }
                    if outcome.is_ok() {
                        prop_assert!(scheduler.is_loaded(&desc.name));
                    }
                }
                Op::Unload(model) => {
                    if let Some(desc) = descriptors.get(model) {
                        scheduler.unload(&desc.name);
                    }
                }
                Op::Touch(model) => {
                    if let Some(desc) = descriptors.get(model) {
                        scheduler.touch(&desc.name);
                    }
                }
            }
            prop_assert!(scheduler.used_ram_gb() <= total);
            prop_assert!(scheduler.loaded().len() <= max_concurrent);
        }
    }
}
