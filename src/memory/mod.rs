pub(crate) mod bitmap;
pub(crate) mod heap;
pub(crate) mod large;
pub(crate) mod partition;
pub(crate) mod rng;
pub(crate) mod spinlock;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
