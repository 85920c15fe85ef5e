//! Tiered "current value on this thread" cache used for contexts and engines.
//!
//! A profile starts in the constant tier, where one value is claimed by one
//! thread and entries are counted. Seeing a second value demotes it to the
//! dynamic tier, a single slot owned by one thread. As soon as another
//! thread shows up the profile moves to per-thread slots. Demotions happen
//! only inside `enter` and are never undone.
//!
//! The first two tiers are served from atomics alone; the demotion lock is
//! only taken on the way down.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use runtime_core::{ThreadHandle, ThreadKey};

static PROFILE_IDS: AtomicU64 = AtomicU64::new(1);

type AnySlot = Option<Arc<dyn Any + Send + Sync>>;

thread_local! {
    static THREAD_SLOTS: RefCell<HashMap<u64, AnySlot>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProfileTier {
    Constant,
    Dynamic,
    ThreadLocal,
}

impl ProfileTier {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProfileTier::Constant,
            1 => ProfileTier::Dynamic,
            _ => ProfileTier::ThreadLocal,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ProfileTier::Constant => 0,
            ProfileTier::Dynamic => 1,
            ProfileTier::ThreadLocal => 2,
        }
    }
}

/// How many `get`/`enter` calls each tier has served.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TierHits {
    pub constant: u64,
    pub dynamic: u64,
    pub thread_local: u64,
}

#[derive(Default)]
struct TierCounters {
    constant: AtomicU64,
    dynamic: AtomicU64,
    thread_local: AtomicU64,
}

impl TierCounters {
    fn record(&self, tier: ProfileTier) {
        let counter = match tier {
            ProfileTier::Constant => &self.constant,
            ProfileTier::Dynamic => &self.dynamic,
            ProfileTier::ThreadLocal => &self.thread_local,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// The constant and dynamic tiers share one word: the owning thread's key in
// the high bits and the constant-tier entry depth in the low bits. A depth of
// `DEPTH_MASK` marks a dynamic-tier word. Zero is an unclaimed slot.
const DEPTH_BITS: u32 = 20;
const DEPTH_MASK: u64 = (1 << DEPTH_BITS) - 1;
// The owner moved its value into its per-thread slot.
const HANDED_OFF: u64 = u64::MAX;

fn pack(owner: ThreadKey, depth: u64) -> u64 {
    (owner << DEPTH_BITS) | depth
}

fn owner_of(word: u64) -> ThreadKey {
    word >> DEPTH_BITS
}

fn depth_of(word: u64) -> u64 {
    word & DEPTH_MASK
}

fn is_constant_word(word: u64) -> bool {
    word != 0 && depth_of(word) != DEPTH_MASK
}

pub struct Profile<T> {
    id: u64,
    name: &'static str,
    tier: AtomicU8,
    slot: AtomicU64,
    // Address of the value that claimed the constant tier. Compared, never
    // dereferenced, so it does not keep the value alive.
    constant: AtomicUsize,
    // Strong reference to the value active on the slot owner's thread. Only
    // the owner swaps it, which is what makes the unsafe reads below sound.
    current: AtomicPtr<T>,
    demotion: Mutex<()>,
    hits: TierCounters,
    _owns: PhantomData<Arc<T>>,
}

impl<T: Send + Sync + 'static> Profile<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            id: PROFILE_IDS.fetch_add(1, Ordering::Relaxed),
            name,
            tier: AtomicU8::new(ProfileTier::Constant.as_u8()),
            slot: AtomicU64::new(0),
            constant: AtomicUsize::new(0),
            current: AtomicPtr::new(ptr::null_mut()),
            demotion: Mutex::new(()),
            hits: TierCounters::default(),
            _owns: PhantomData,
        }
    }

    pub fn tier(&self) -> ProfileTier {
        ProfileTier::from_u8(self.tier.load(Ordering::Acquire))
    }

    pub fn hits(&self) -> TierHits {
        TierHits {
            constant: self.hits.constant.load(Ordering::Relaxed),
            dynamic: self.hits.dynamic.load(Ordering::Relaxed),
            thread_local: self.hits.thread_local.load(Ordering::Relaxed),
        }
    }

    /// The value currently entered on the calling thread.
    pub fn get(&self) -> Option<Arc<T>> {
        let tier = self.tier();
        self.hits.record(tier);
        if tier == ProfileTier::ThreadLocal {
            return self.thread_local_get();
        }
        if owner_of(self.slot.load(Ordering::Acquire)) != ThreadHandle::current_key() {
            return None;
        }
        self.current_clone()
    }

    /// Makes `value` current on this thread and returns what it replaced.
    pub fn enter(&self, value: &Arc<T>) -> Option<Arc<T>> {
        let me = ThreadHandle::current_key();
        let address = Arc::as_ptr(value) as usize;
        loop {
            match self.tier() {
                ProfileTier::Constant => {
                    let word = self.slot.load(Ordering::Acquire);
                    if word == 0 {
                        if self.claim(word, pack(me, 1)) {
                            self.constant.store(address, Ordering::Release);
                            self.current_replace(Some(Arc::clone(value)));
                            self.hits.record(ProfileTier::Constant);
                            return None;
                        }
                        continue;
                    }
                    let depth = depth_of(word);
                    let same = is_constant_word(word)
                        && depth + 1 < DEPTH_MASK
                        && self.constant.load(Ordering::Acquire) == address;
                    // An idle slot holding this value may move to another thread.
                    if same && (owner_of(word) == me || depth == 0) {
                        if self.claim(word, pack(me, depth + 1)) {
                            self.hits.record(ProfileTier::Constant);
                            if depth > 0 {
                                return Some(Arc::clone(value));
                            }
                            self.current_replace(Some(Arc::clone(value)));
                            return None;
                        }
                        continue;
                    }
                    self.demote(me);
                }
                ProfileTier::Dynamic => {
                    if owner_of(self.slot.load(Ordering::Acquire)) == me {
                        self.hits.record(ProfileTier::Dynamic);
                        return self.current_replace(Some(Arc::clone(value)));
                    }
                    self.demote(me);
                }
                ProfileTier::ThreadLocal => {
                    self.hits.record(ProfileTier::ThreadLocal);
                    return self.thread_local_swap(Some(Arc::clone(value)));
                }
            }
        }
    }

    /// Restores the value returned by the matching [`Profile::enter`].
    pub fn leave(&self, previous: Option<Arc<T>>) {
        let me = ThreadHandle::current_key();
        match self.tier() {
            ProfileTier::Constant => {
                let word = self.slot.load(Ordering::Acquire);
                let depth = depth_of(word);
                debug_assert!(
                    owner_of(word) == me && is_constant_word(word) && depth > 0,
                    "{} profile left without a matching enter",
                    self.name
                );
                if owner_of(word) != me || !is_constant_word(word) || depth == 0 {
                    return;
                }
                if depth == 1 {
                    drop(self.current_replace(None));
                }
                // A word with a non-zero depth is only written by its owner.
                self.slot.store(pack(me, depth - 1), Ordering::Release);
            }
            ProfileTier::Dynamic => {
                debug_assert_eq!(
                    owner_of(self.slot.load(Ordering::Acquire)),
                    me,
                    "{} profile left on a foreign thread",
                    self.name
                );
                self.current_replace(previous);
            }
            ProfileTier::ThreadLocal => {
                self.thread_local_swap(previous);
            }
        }
    }

    /// Forgets `value` once it can no longer be entered. An idle constant slot
    /// claimed by it becomes claimable again without demoting; the calling
    /// thread's own slot drops it too.
    pub fn clear(&self, value: &T) {
        let target: *const T = value;
        let address = target as usize;
        if self.tier() == ProfileTier::Constant && self.constant.load(Ordering::Acquire) == address {
            let word = self.slot.load(Ordering::Acquire);
            if is_constant_word(word) && depth_of(word) == 0 && self.claim(word, 0) {
                let _ = self.constant.compare_exchange(address, 0, Ordering::AcqRel, Ordering::Acquire);
            }
        }

        THREAD_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            let holds = slots.get(&self.id).and_then(Option::as_ref).is_some_and(|current| {
                std::ptr::eq(Arc::as_ptr(current) as *const (), target as *const ())
            });
            if holds {
                slots.remove(&self.id);
            }
        });
    }

    fn claim(&self, expected: u64, word: u64) -> bool {
        self.slot
            .compare_exchange(expected, word, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Slow path shared by both fast tiers. Callers retry `enter` afterwards.
    fn demote(&self, me: ThreadKey) {
        let _demotion = self.demotion.lock();
        match self.tier() {
            ProfileTier::Constant => loop {
                let word = self.slot.load(Ordering::Acquire);
                if word == 0 {
                    return;
                }
                let owner = owner_of(word);
                if owner == me || depth_of(word) == 0 {
                    // The caller owns the slot from here on; an active value
                    // of its own stays in `current`.
                    if self.claim(word, pack(me, DEPTH_MASK)) {
                        self.set_tier(ProfileTier::Dynamic);
                        return;
                    }
                    continue;
                }
                // Another thread is inside its value. It picks that value up
                // from `current` on its first per-thread access.
                self.set_tier(ProfileTier::ThreadLocal);
                return;
            },
            ProfileTier::Dynamic => {
                if owner_of(self.slot.load(Ordering::Acquire)) != me {
                    self.set_tier(ProfileTier::ThreadLocal);
                }
            }
            ProfileTier::ThreadLocal => {}
        }
    }

    fn set_tier(&self, tier: ProfileTier) {
        self.tier.store(tier.as_u8(), Ordering::Release);
        tracing::debug!("{} profile {} demoted to {:?} tier", self.name, self.id, tier);
    }

    fn current_clone(&self) -> Option<Arc<T>> {
        let raw = self.current.load(Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        // SAFETY: `raw` came from `Arc::into_raw` and only this thread, the
        // slot owner, can release it, so the count is still held.
        unsafe {
            Arc::increment_strong_count(raw);
            Some(Arc::from_raw(raw))
        }
    }

    fn current_replace(&self, value: Option<Arc<T>>) -> Option<Arc<T>> {
        let raw = value.map_or(ptr::null_mut(), |value| Arc::into_raw(value) as *mut T);
        let previous = self.current.swap(raw, Ordering::AcqRel);
        // SAFETY: every non-null `current` holds one count from `Arc::into_raw`.
        (!previous.is_null()).then(|| unsafe { Arc::from_raw(previous) })
    }

    // First per-thread access after a demotion: the former slot owner takes
    // the value it still had active.
    fn take_handoff(&self, me: ThreadKey) -> AnySlot {
        loop {
            let word = self.slot.load(Ordering::Acquire);
            if word == HANDED_OFF || owner_of(word) != me {
                return None;
            }
            if self.claim(word, HANDED_OFF) {
                return self
                    .current_replace(None)
                    .map(|value| value as Arc<dyn Any + Send + Sync>);
            }
        }
    }

    fn thread_local_get(&self) -> Option<Arc<T>> {
        let me = ThreadHandle::current_key();
        THREAD_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots.entry(self.id).or_insert_with(|| self.take_handoff(me));
            slot.clone().and_then(|current| current.downcast::<T>().ok())
        })
    }

    fn thread_local_swap(&self, value: Option<Arc<T>>) -> Option<Arc<T>> {
        let me = ThreadHandle::current_key();
        THREAD_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots.entry(self.id).or_insert_with(|| self.take_handoff(me));
            let previous = match value {
                Some(value) => slot.replace(value as Arc<dyn Any + Send + Sync>),
                None => slot.take(),
            };
            if slot.is_none() {
                slots.remove(&self.id);
            }
            previous.and_then(|previous| previous.downcast::<T>().ok())
        })
    }
}

impl<T> Drop for Profile<T> {
    fn drop(&mut self) {
        let raw = *self.current.get_mut();
        if !raw.is_null() {
            // SAFETY: see `current_replace`.
            drop(unsafe { Arc::from_raw(raw) });
        }
    }
}
