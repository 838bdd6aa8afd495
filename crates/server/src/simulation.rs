use glam::{Quat, Vec3};

use worldsync::{
    BlueprintDraft, DataValue, EntitySpec, Owner, SyncResult, Transform, World,
};

/// Custom-data key holding a spin rate in radians per second.
pub const SPIN_KEY: &str = "spin_rate";

/// Publishes the turntable blueprint and places `count` of them in a ring.
pub fn populate(world: &mut World, count: usize) -> SyncResult<()> {
    if count == 0 {
        return Ok(());
    }

    let blueprint = world.publish_blueprint(
        BlueprintDraft::new("turntable")
            .with_description("Server-driven spinning platform")
            .with_model("models/turntable.glb"),
    )?;

    for i in 0..count {
        let angle = i as f32 / count as f32 * std::f32::consts::TAU;
        let position = Vec3::new(angle.cos() * 10.0, 0.0, angle.sin() * 10.0);
        let spec = EntitySpec::app(blueprint)
            .with_owner(Owner::Server)
            .with_transform(Transform::from_position(position))
            .with_custom(SPIN_KEY, DataValue::Float(0.5 + i as f64 * 0.25));
        world.add_entity(spec, true)?;
    }

    log::info!("placed {} turntables", count);
    Ok(())
}

/// Where new players appear: the middle of the turntable ring.
pub fn spawn_point() -> Transform {
    Transform::from_position(Vec3::new(0.0, 1.0, 0.0))
}

/// Moves server-authored entities. The world picks the new transforms up from
/// the spatial system on its next advance.
pub fn simulate_world(world: &mut World, dt: f32) {
    let spinning: Vec<_> = world
        .entities()
        .filter_map(|entity| match entity.custom.get(SPIN_KEY) {
            Some(DataValue::Float(rate)) => Some((entity.id, entity.transform, *rate as f32)),
            _ => None,
        })
        .filter(|(id, _, _)| world.owner(*id) == Some(Owner::Server))
        .collect();

    for (id, mut transform, rate) in spinning {
        transform.rotation = (Quat::from_rotation_y(rate * dt) * transform.rotation).normalize();
        world.spatial_mut().apply_transform(id, &transform);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldsync::TransformCache;

    #[test]
    fn turntables_spin_while_server_owned() {
        let mut world = World::server(Box::new(TransformCache::new()));
        populate(&mut world, 2).unwrap();
        let ids: Vec<_> = world.entities().map(|e| e.id).collect();

        world.claim(ids[1], worldsync::SessionId(4)).unwrap();
        simulate_world(&mut world, 1.0);
        world.advance(1, 33);

        let rotation = |id| world.get(id).unwrap().transform.rotation;
        assert_ne!(rotation(ids[0]), Quat::IDENTITY);
        assert_eq!(rotation(ids[1]), Quat::IDENTITY);
    }
}
