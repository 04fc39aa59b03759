use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

/// A cell the boot path writes once and everything else only reads.
///
/// The frame allocator, its address-range check and the kernel page
/// table all live in statics of this type: one hart fills them in early,
/// and every later reader gets at them without a lock. The value is not
/// published until it is fully written, so a reader never observes a
/// half-built allocator.
pub struct Once<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T> Sync for Once<T> where T: Send {}

impl<T> Once<T> {
    /// An empty cell.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Fills the cell in.
    ///
    /// The cell is claimed first, then written, then marked ready; a
    /// reader racing with the write sees "not ready", never a torn
    /// value.
    ///
    /// # Panics
    ///
    /// Panics if the cell was already filled in. Running the memory
    /// setup twice is a boot-sequence bug.
    #[track_caller]
    pub fn init(&self, value: T) {
        assert!(
            self.state
                .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok(),
            "double init of a write-once cell"
        );

        unsafe {
            (*self.value.get()).write(value);
        }
        self.state.store(READY, Ordering::Release);
    }

    /// Returns the stored value.
    ///
    /// # Panics
    ///
    /// Panics if the cell is still empty, i.e. memory is being used
    /// before the boot path set it up.
    #[track_caller]
    pub fn get(&self) -> &T {
        assert!(
            self.state.load(Ordering::Acquire) == READY,
            "write-once cell read before init"
        );

        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Drop for Once<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            unsafe {
                (*self.value.get()).assume_init_drop();
            }
        }
    }
}
