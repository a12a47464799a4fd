//! Process-wide table of channels.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::channel::{Channel, IrqReturn};
use crate::device::ChannelId;
use crate::error::{CoreError, Result};
use crate::time::Tick;

const FREE: u32 = u32::MAX;

/// Bus token shared by channels whose chipset cannot run commands on both at once.
///
/// A channel acquires the token when its scheduler finds work and releases it once it is fully
/// idle; the releasing channel then kicks its peers' schedulers.
pub(crate) struct SerializeGroup {
    holder: AtomicU32,
    members: Mutex<Vec<Weak<Channel>>>,
}

impl SerializeGroup {
    pub(crate) fn new(members: &[&Arc<Channel>]) -> Arc<Self> {
        Arc::new(Self {
            holder: AtomicU32::new(FREE),
            members: Mutex::new(members.iter().map(|ch| Arc::downgrade(ch)).collect()),
        })
    }

    /// Take the token, or confirm `id` already holds it.
    pub(crate) fn try_acquire(&self, id: ChannelId) -> bool {
        let me = u32::from(id.0);
        match self
            .holder
            .compare_exchange(FREE, me, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == me,
        }
    }

    /// Give the token back. Returns `true` if `id` was holding it.
    pub(crate) fn release(&self, id: ChannelId) -> bool {
        let me = u32::from(id.0);
        self.holder
            .compare_exchange(me, FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn holder(&self) -> Option<ChannelId> {
        match self.holder.load(Ordering::Acquire) {
            FREE => None,
            id => u16::try_from(id).ok().map(ChannelId),
        }
    }

    pub(crate) fn peers(&self, id: ChannelId) -> Vec<Arc<Channel>> {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|ch| ch.id() != id)
            .collect()
    }

    pub(crate) fn remove(&self, id: ChannelId) {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|ch| ch.upgrade().is_some_and(|ch| ch.id() != id));
    }
}

/// Owns every channel by [`ChannelId`].
#[derive(Default)]
pub struct Registry {
    channels: BTreeMap<ChannelId, Arc<Channel>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. If it and its sibling both ask to be serialized, they are paired.
    pub fn attach(&mut self, channel: Arc<Channel>) -> Result<()> {
        let id = channel.id();
        if self.channels.contains_key(&id) {
            return Err(CoreError::DuplicateChannel(id));
        }
        let sibling = self
            .channels
            .get(&id.sibling())
            .filter(|sibling| {
                channel.config().serialize_with_sibling && sibling.config().serialize_with_sibling
            })
            .cloned();
        self.channels.insert(id, channel.clone());
        if let Some(sibling) = sibling {
            tracing::debug!(channel = %id, sibling = %sibling.id(), "serializing with sibling");
            pair(&sibling, &channel);
        }
        Ok(())
    }

    /// Remove an idle channel. Its queued requests are failed, not dropped.
    pub fn detach(&mut self, id: ChannelId) -> Result<Arc<Channel>> {
        let channel = self
            .channels
            .get(&id)
            .ok_or(CoreError::UnknownChannel(id))?;
        channel.shutdown()?;
        channel.leave_group();
        self.channels
            .remove(&id)
            .ok_or(CoreError::UnknownChannel(id))
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(&id).cloned()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }

    /// Make two channels share one bus token. Both must be idle.
    pub fn pair_serialized(&self, a: ChannelId, b: ChannelId) -> Result<()> {
        if a == b {
            return Err(CoreError::InvalidConfig("a channel cannot be serialized with itself"));
        }
        let first = self.channels.get(&a).ok_or(CoreError::UnknownChannel(a))?;
        let second = self.channels.get(&b).ok_or(CoreError::UnknownChannel(b))?;
        for ch in [first, second] {
            if ch.is_busy() {
                return Err(CoreError::ChannelBusy(ch.id()));
            }
        }
        pair(first, second);
        Ok(())
    }

    /// Channel currently owning the bus token shared with `id`, if any.
    pub fn bus_holder(&self, id: ChannelId) -> Option<ChannelId> {
        self.channels.get(&id).and_then(|ch| ch.group_holder())
    }

    /// Offer an interrupt on `line` to every channel wired to it until one claims it.
    pub fn handle_irq(&self, line: u8) -> IrqReturn {
        for channel in self.channels.values().filter(|ch| ch.config().irq == line) {
            if channel.handle_interrupt() == IrqReturn::Handled {
                return IrqReturn::Handled;
            }
        }
        IrqReturn::None
    }

    /// Run every due channel timer. Returns how many fired.
    pub fn fire_timers(&self) -> usize {
        self.channels
            .values()
            .filter(|ch| ch.handle_timer())
            .count()
    }

    pub fn next_deadline(&self) -> Option<Tick> {
        self.channels
            .values()
            .filter_map(|ch| ch.next_deadline())
            .min()
    }
}

fn pair(a: &Arc<Channel>, b: &Arc<Channel>) {
    let group = SerializeGroup::new(&[a, b]);
    a.join_group(group.clone());
    b.join_group(group);
}
