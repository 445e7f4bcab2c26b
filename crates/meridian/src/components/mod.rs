//! Built-in Components
//!
//! Component types shipped with the binary. Deployments select them by
//! type tag in `controller_components`.

pub mod moving_average;
pub mod thermal_storage;
pub mod two_point_controller;

pub use moving_average::MovingAverage;
pub use thermal_storage::ThermalStorage;
pub use two_point_controller::TwoPointController;

use meridian_runtime::ComponentRegistry;

/// Register every built-in component type
pub fn register_builtin(registry: &mut ComponentRegistry) {
    registry.register_fn(
        two_point_controller::TYPE_TAG,
        two_point_controller::schema(),
        |_| Ok(Box::new(TwoPointController::new())),
    );
    registry.register_fn(moving_average::TYPE_TAG, moving_average::schema(), |_| {
        Ok(Box::new(MovingAverage::new()))
    });
    registry.register_fn(thermal_storage::TYPE_TAG, thermal_storage::schema(), |_| {
        Ok(Box::new(ThermalStorage::new()))
    });
}

/// Registry holding the built-in component types
pub fn builtin_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    register_builtin(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types_registered() {
        let registry = builtin_registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("two_point_controller"));
        assert!(registry.contains("moving_average"));
        assert!(registry.contains("thermal_storage"));

        let schema = registry.schema("two_point_controller").unwrap();
        assert!(schema.static_data.iter().any(|p| p.name == "setpoint" && p.required));

        let schema = registry.schema("thermal_storage").unwrap();
        let required: Vec<_> = schema.inputs.iter().filter(|p| p.required).map(|p| p.name.as_str()).collect();
        assert_eq!(required, vec!["temperature_1", "temperature_2", "temperature_3"]);
        assert!(schema.outputs.iter().all(|p| !p.required));
    }
}
