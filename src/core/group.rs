//! Process-wide command groups.
//!
//! A group is a named namespace of command definitions and executor
//! pools. Groups are singletons keyed by name: constructing an existing
//! name returns the existing instance. Registries are append-only, with
//! [`Group::clear_all`] as the test-isolation escape hatch.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::core::command::{short_type_name, Command, CommandHandle, CommandSeat, DEFAULT_POOL};
use crate::core::error::CommandError;
use crate::core::pool::Pool;

struct GroupInner {
    name: String,
    commands: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    executors: Mutex<HashMap<String, Pool>>,
}

/// A named namespace of commands and pools. Cheap to clone; all clones
/// share the singleton state.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

static GROUPS: OnceLock<Mutex<HashMap<String, Group>>> = OnceLock::new();

fn groups() -> &'static Mutex<HashMap<String, Group>> {
    GROUPS.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Group {
    /// Look up or create the singleton group `name`. A fresh group starts
    /// with the process-wide default pool installed as its `default`
    /// executor.
    pub fn named(name: &str) -> Group {
        let mut map = groups().lock();
        if let Some(existing) = map.get(name) {
            return existing.clone();
        }
        let group = Group {
            inner: Arc::new(GroupInner {
                name: name.to_string(),
                commands: Mutex::new(HashMap::new()),
                executors: Mutex::new(HashMap::new()),
            }),
        };
        group.add_executor(Pool::named(DEFAULT_POOL));
        map.insert(name.to_string(), group.clone());
        debug!(group = name, "group created");
        group
    }

    /// The group's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a command definition with this group.
    ///
    /// The command must declare this group as its own; its name (explicit
    /// or type-derived) must be unique within the group. On success the
    /// definition is bound to the group and a typed handle is returned.
    pub fn register<C: Command>(&self, command: C) -> Result<CommandHandle<C>, CommandError> {
        if command.group() != self.inner.name {
            return Err(CommandError::Setup(format!(
                "command {:?} declares group {:?} but was registered with group {:?}",
                command.name(),
                command.group(),
                self.inner.name
            )));
        }
        let name = command.name().to_string();
        let pool = command.pool().to_string();
        let mut commands = self.inner.commands.lock();
        if commands.contains_key(&name) {
            return Err(CommandError::Name {
                name,
                group: self.inner.name.clone(),
            });
        }
        let seat = Arc::new(CommandSeat {
            command,
            name: name.clone(),
            group: self.clone(),
            pool,
        });
        commands.insert(name.clone(), seat.clone() as Arc<dyn Any + Send + Sync>);
        debug!(command = %name, group = %self.inner.name, "command registered");
        Ok(CommandHandle { seat })
    }

    /// Typed lookup of a registered command. Fails with a not-found error
    /// for unknown names and a type error when the stored definition is
    /// not a `C`.
    pub fn get_command<C: Command>(&self, name: &str) -> Result<CommandHandle<C>, CommandError> {
        let stored = {
            let commands = self.inner.commands.lock();
            commands.get(name).cloned()
        };
        let Some(stored) = stored else {
            return Err(CommandError::NotFound {
                command: name.to_string(),
                group: self.inner.name.clone(),
            });
        };
        stored
            .downcast::<CommandSeat<C>>()
            .map(|seat| CommandHandle { seat })
            .map_err(|_| {
                CommandError::Type(format!(
                    "command {:?} in group {:?} is not a {}",
                    name,
                    self.inner.name,
                    short_type_name::<C>()
                ))
            })
    }

    /// Look up an executor pool by name.
    pub fn get_executor(&self, name: &str) -> Result<Pool, CommandError> {
        self.inner
            .executors
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| CommandError::ExecutorNotFound {
                executor: name.to_string(),
                group: self.inner.name.clone(),
            })
    }

    /// Register a pool as an executor of this group. Idempotent: an
    /// executor already present under the pool's name stays (first wins).
    pub fn add_executor(&self, pool: Pool) {
        let mut executors = self.inner.executors.lock();
        executors.entry(pool.name().to_string()).or_insert(pool);
    }

    /// Whether a command with `name` is registered here.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.commands.lock().contains_key(name)
    }

    /// Forget every command registered with this group.
    pub fn clear(&self) {
        self.inner.commands.lock().clear();
    }

    /// Clear every group and forget the singletons. Test isolation helper.
    pub fn clear_all() {
        let mut map = groups().lock();
        for group in map.values() {
            group.clear();
        }
        map.clear();
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Group {}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.inner.name)
            .field("commands", &self.inner.commands.lock().len())
            .field("executors", &self.inner.executors.lock().len())
            .finish()
    }
}
