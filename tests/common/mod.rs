use dsm_tree::{
    transport::MemoryPool, Config, ReadRegion, RemotePtr, Transport, Tree, WriteRegion,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[allow(dead_code)]
pub const POOL_BYTES: usize = 64 * 1024 * 1024;

#[allow(dead_code)]
pub fn tree() -> Tree<MemoryPool> {
    Config::new()
        .open(MemoryPool::new(POOL_BYTES))
        .expect("in-memory pool never fails to open")
}

#[allow(dead_code)]
pub fn tree_with(config: Config) -> Tree<MemoryPool> {
    config
        .open(MemoryPool::new(POOL_BYTES))
        .expect("in-memory pool never fails to open")
}

/// A pool whose remote writes can be made to fail on demand, for
/// driving the error paths the always-healthy [`MemoryPool`] never
/// exercises.
#[allow(dead_code)]
pub struct FaultyPool {
    inner: MemoryPool,
    fail_writes: AtomicBool,
}

#[allow(dead_code)]
impl FaultyPool {
    pub fn new() -> Self {
        Self {
            inner: MemoryPool::new(POOL_BYTES),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> std::io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected write failure",
            ))
        } else {
            Ok(())
        }
    }
}

impl Transport for FaultyPool {
    fn read(&self, local: &mut [u8], remote: RemotePtr) -> std::io::Result<()> {
        self.inner.read(local, remote)
    }

    fn write(&self, local: &[u8], remote: RemotePtr) -> std::io::Result<()> {
        self.check_writable()?;
        self.inner.write(local, remote)
    }

    fn cas(&self, remote: RemotePtr, expected: u64, desired: u64) -> std::io::Result<u64> {
        self.inner.cas(remote, expected, desired)
    }

    fn cas_mask(
        &self,
        remote: RemotePtr,
        expected: u64,
        desired: u64,
        mask: u64,
    ) -> std::io::Result<u64> {
        self.inner.cas_mask(remote, expected, desired, mask)
    }

    fn read_batch(&self, regions: &mut [ReadRegion<'_>]) -> std::io::Result<()> {
        self.inner.read_batch(regions)
    }

    fn write_batch(&self, regions: &[WriteRegion<'_>]) -> std::io::Result<()> {
        self.check_writable()?;
        self.inner.write_batch(regions)
    }

    fn alloc(&self, len: usize, align_bits: u32) -> std::io::Result<RemotePtr> {
        self.inner.alloc(len, align_bits)
    }
}

/// Two tree handles ("clients") sharing one pool; only the first
/// bootstraps the root.
#[allow(dead_code)]
pub fn two_clients() -> (Tree<Arc<MemoryPool>>, Tree<Arc<MemoryPool>>, Arc<MemoryPool>) {
    let pool = Arc::new(MemoryPool::new(POOL_BYTES));
    let a = Config::new()
        .open(Arc::clone(&pool))
        .expect("in-memory pool never fails to open");
    let b = Config::new()
        .init_root(false)
        .open(Arc::clone(&pool))
        .expect("in-memory pool never fails to open");
    (a, b, pool)
}
