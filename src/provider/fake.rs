//! Recording provisioner for engine tests.
//!
//! Objects live in a shared [`FakeCloud`]. Every call records an
//! [`Event`] with start and end ticks from one global counter, so tests
//! can assert that one operation finished before another started.
//!
//! Attribute hooks: `fail = true` fails create/update, `fail_delete = true`
//! fails delete, `delay_ms = N` sleeps before answering.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Attributes, Value};
use crate::error::{ProvisionError, ProvisionResult};

use super::{Created, ProviderRegistry, Provisioner, ResourceSchema};

/// Operation kind recorded by the fake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Read,
    Update,
    Delete,
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct Event {
    pub op: Op,
    /// The object's `name` attribute, or its real id when unnamed.
    pub label: String,
    pub real_id: String,
    pub start: u64,
    pub end: u64,
    pub ok: bool,
}

/// Shared world the fake provisioners act on.
#[derive(Debug, Default)]
pub struct FakeCloud {
    objects: Mutex<BTreeMap<String, Attributes>>,
    events: Mutex<Vec<Event>>,
    ticks: AtomicU64,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Provisioner backed by a [`FakeCloud`].
#[derive(Debug, Clone)]
pub struct FakeProvisioner {
    cloud: Arc<FakeCloud>,
    kind: String,
}

struct InFlight<'a>(&'a FakeCloud);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry with one fake provisioner per type name.
    pub fn registry(self: &Arc<Self>, types: &[&str]) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for kind in types {
            registry.register(
                *kind,
                Arc::new(FakeProvisioner {
                    cloud: Arc::clone(self),
                    kind: (*kind).to_string(),
                }),
            );
        }
        registry
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Events of one kind, in completion order.
    pub fn events_of(&self, op: Op) -> Vec<Event> {
        self.events().into_iter().filter(|e| e.op == op).collect()
    }

    /// First successful event of `op` for `label`.
    pub fn find(&self, op: Op, label: &str) -> Option<Event> {
        self.events()
            .into_iter()
            .find(|e| e.op == op && e.ok && e.label == label)
    }

    /// Number of mutating calls (create, update, delete).
    pub fn mutations(&self) -> usize {
        self.events().iter().filter(|e| e.op != Op::Read).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn object(&self, real_id: &str) -> Option<Attributes> {
        self.objects.lock().unwrap().get(real_id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Changes an object behind the engine's back.
    pub fn tamper(&self, real_id: &str, attribute: &str, value: Value) {
        if let Some(attrs) = self.objects.lock().unwrap().get_mut(real_id) {
            attrs.insert(attribute.to_string(), value);
        }
    }

    /// Deletes an object behind the engine's back.
    pub fn vanish(&self, real_id: &str) {
        self.objects.lock().unwrap().remove(real_id);
    }

    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    fn record(&self, op: Op, label: String, real_id: String, start: u64, ok: bool) {
        let end = self.tick();
        self.events.lock().unwrap().push(Event {
            op,
            label,
            real_id,
            start,
            end,
            ok,
        });
    }
}

fn label_of(attributes: &Attributes, real_id: &str) -> String {
    attributes
        .get("name")
        .and_then(Value::as_str)
        .map_or_else(|| real_id.to_string(), ToString::to_string)
}

fn flag(attributes: &Attributes, name: &str) -> bool {
    matches!(attributes.get(name), Some(Value::Bool(true)))
}

async fn delay(attributes: &Attributes) {
    if let Some(Value::Number(n)) = attributes.get("delay_ms")
        && let Some(ms) = n.as_u64()
    {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new()
            .with_replacement(["image", "zone"])
            .with_computed(["id", "arn"])
    }

    async fn create(&self, attributes: &Attributes) -> ProvisionResult<Created> {
        let cloud = &self.cloud;
        let _guard = cloud.enter();
        let start = cloud.tick();
        delay(attributes).await;

        let real_id = format!(
            "{}-{}",
            self.kind,
            cloud.next_id.fetch_add(1, Ordering::SeqCst) + 1
        );
        let label = label_of(attributes, &real_id);
        if flag(attributes, "fail") {
            cloud.record(Op::Create, label, real_id, start, false);
            return Err(ProvisionError::api("injected create failure"));
        }

        let mut created = attributes.clone();
        created.insert("id".to_string(), Value::from(real_id.as_str()));
        created.insert(
            "arn".to_string(),
            Value::from(format!("arn:fake:{}", real_id)),
        );
        cloud
            .objects
            .lock()
            .unwrap()
            .insert(real_id.clone(), created.clone());
        cloud.record(Op::Create, label, real_id.clone(), start, true);
        Ok(Created {
            real_id,
            attributes: created,
        })
    }

    async fn read(&self, real_id: &str) -> ProvisionResult<Option<Attributes>> {
        let start = self.cloud.tick();
        let found = self.cloud.object(real_id);
        let label = found
            .as_ref()
            .map_or_else(|| real_id.to_string(), |a| label_of(a, real_id));
        self.cloud
            .record(Op::Read, label, real_id.to_string(), start, true);
        Ok(found)
    }

    async fn update(&self, real_id: &str, attributes: &Attributes) -> ProvisionResult<Attributes> {
        let cloud = &self.cloud;
        let _guard = cloud.enter();
        let start = cloud.tick();
        delay(attributes).await;

        let label = label_of(attributes, real_id);
        if flag(attributes, "fail") {
            cloud.record(Op::Update, label, real_id.to_string(), start, false);
            return Err(ProvisionError::api("injected update failure"));
        }
        let mut objects = cloud.objects.lock().unwrap();
        let Some(existing) = objects.get_mut(real_id) else {
            drop(objects);
            cloud.record(Op::Update, label, real_id.to_string(), start, false);
            return Err(ProvisionError::NotFound {
                real_id: real_id.to_string(),
            });
        };
        let mut updated = attributes.clone();
        for computed in ["id", "arn"] {
            if let Some(value) = existing.get(computed) {
                updated.insert(computed.to_string(), value.clone());
            }
        }
        *existing = updated.clone();
        drop(objects);
        cloud.record(Op::Update, label, real_id.to_string(), start, true);
        Ok(updated)
    }

    async fn delete(&self, real_id: &str) -> ProvisionResult<()> {
        let cloud = &self.cloud;
        let _guard = cloud.enter();
        let start = cloud.tick();
        let existing = cloud.object(real_id);
        if let Some(attrs) = &existing {
            delay(attrs).await;
        }

        let label = existing
            .as_ref()
            .map_or_else(|| real_id.to_string(), |a| label_of(a, real_id));
        match existing {
            None => {
                cloud.record(Op::Delete, label, real_id.to_string(), start, false);
                Err(ProvisionError::NotFound {
                    real_id: real_id.to_string(),
                })
            }
            Some(attrs) if flag(&attrs, "fail_delete") => {
                cloud.record(Op::Delete, label, real_id.to_string(), start, false);
                Err(ProvisionError::api("injected delete failure"))
            }
            Some(_) => {
                cloud.objects.lock().unwrap().remove(real_id);
                cloud.record(Op::Delete, label, real_id.to_string(), start, true);
                Ok(())
            }
        }
    }
}
