use std::cell::RefCell;
use std::rc::Rc;

use bevy::ecs::world::EntityWorldMut;
use bevy::prelude::*;

use crate::error::BindingError;

/// Shared slot through which script callbacks reach the `World`.
///
/// Lua closures live as long as their environment, so they cannot hold a
/// borrow of the world. Instead an exclusive system lends the world to the
/// slot for the duration of a script entry with [`WorldAccess::enter`], and
/// callbacks borrow it briefly with [`WorldAccess::with`]. The empty world
/// left behind in the caller's place is kept and reused across entries.
#[derive(Clone, Default)]
pub struct WorldAccess {
    slot: Rc<RefCell<Option<World>>>,
    placeholder: Rc<RefCell<Option<World>>>,
}

struct Restore<'a> {
    access: &'a WorldAccess,
    world: &'a mut World,
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        if let Some(lent) = self.access.slot.borrow_mut().take() {
            let placeholder = std::mem::replace(self.world, lent);
            *self.access.placeholder.borrow_mut() = Some(placeholder);
        }
    }
}

impl WorldAccess {
    pub fn enter<R>(&self, world: &mut World, f: impl FnOnce() -> R) -> R {
        debug_assert!(self.slot.borrow().is_none(), "world lent twice");
        let placeholder = self.placeholder.borrow_mut().take().unwrap_or_default();
        let lent = std::mem::replace(world, placeholder);
        *self.slot.borrow_mut() = Some(lent);
        let _restore = Restore {
            access: self,
            world,
        };
        f()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut World) -> R) -> Result<R, BindingError> {
        let mut slot = self
            .slot
            .try_borrow_mut()
            .map_err(|_| BindingError::WorldUnavailable)?;
        let world = slot.as_mut().ok_or(BindingError::WorldUnavailable)?;
        Ok(f(world))
    }

    #[cfg(test)]
    fn is_entered(&self) -> bool {
        self.slot.try_borrow().map(|s| s.is_some()).unwrap_or(true)
    }
}

/// Decodes a script-side entity handle and checks it is still alive.
pub fn live_entity(world: &World, bits: u64) -> Result<Entity, BindingError> {
    Entity::try_from_bits(bits)
        .ok()
        .filter(|e| world.entities().get(*e).is_some())
        .ok_or(BindingError::EntityNotFound(bits))
}

pub fn live_entity_mut(
    world: &mut World,
    entity: Entity,
) -> Result<EntityWorldMut<'_>, BindingError> {
    world
        .get_entity_mut(entity)
        .map_err(|_| BindingError::EntityNotFound(entity.to_bits()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Resource)]
    struct Marker(u32);

    #[test]
    fn lends_world_and_restores_it_afterwards() {
        let mut world = World::new();
        world.insert_resource(Marker(7));
        let access = WorldAccess::default();

        let seen = access.enter(&mut world, || {
            access
                .with(|w| w.resource::<Marker>().0)
                .expect("world lent")
        });
        assert_eq!(seen, 7);
        assert_eq!(world.resource::<Marker>().0, 7);
        assert!(!access.is_entered());
        assert_eq!(
            access.with(|_| ()).expect_err("not lent"),
            BindingError::WorldUnavailable
        );
    }

    #[test]
    fn rejects_despawned_and_garbage_handles() {
        let mut world = World::new();
        let e = world.spawn_empty().id();
        assert_eq!(live_entity(&world, e.to_bits()), Ok(e));
        world.despawn(e);
        assert_eq!(
            live_entity(&world, e.to_bits()),
            Err(BindingError::EntityNotFound(e.to_bits()))
        );
        assert!(live_entity(&world, 0).is_err());
    }

    #[test]
    fn freed_slot_with_next_generation_is_not_alive() {
        let mut world = World::new();
        let e = world.spawn_empty().id();
        world.despawn(e);
        let next = e.to_bits() + (1 << 32);
        assert_eq!(live_entity(&world, next), Err(BindingError::EntityNotFound(next)));
        let guessed = Entity::from_bits(next);
        assert!(matches!(
            live_entity_mut(&mut world, guessed),
            Err(BindingError::EntityNotFound(bits)) if bits == next
        ));
    }

    #[test]
    fn placeholder_world_is_reused_between_entries() {
        let mut world = World::new();
        let access = WorldAccess::default();
        access.enter(&mut world, || ());
        let first = access.placeholder.borrow().as_ref().map(World::id);
        access.enter(&mut world, || ());
        let second = access.placeholder.borrow().as_ref().map(World::id);
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn world_comes_back_when_a_callback_panics() {
        let mut world = World::new();
        world.insert_resource(Marker(3));
        let access = WorldAccess::default();
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            access.enter(&mut world, || panic!("script host bug"));
        }));
        assert!(unwound.is_err());
        assert_eq!(world.resource::<Marker>().0, 3);
        assert!(!access.is_entered());
    }
}
