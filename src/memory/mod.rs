pub(crate) mod allocator;
pub(crate) mod arena;
pub(crate) mod bin;
pub(crate) mod error;
pub(crate) mod recorder;
pub(crate) mod region;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod virtual_memory;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
