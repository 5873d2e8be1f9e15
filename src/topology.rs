//! Locality classification policies.
//!
//! A NUMA-aware lock needs to know, on every acquisition, which locality
//! domain the calling thread belongs to: hand-offs between waiters of the
//! same domain are cheap, hand-offs across domains pay for a cache-line
//! transfer over the interconnect. The [`Topology`] trait abstracts that
//! classification, together with the monotonic clock that bounds how long
//! the lock may keep favoring one domain.
//!
//! A classification must be cheap (it runs on every lock call) and stable
//! for as long as the thread uses the lock. Threads that must never be
//! penalized by queue reordering (e.g. real-time or interrupt-like
//! contexts) advertise the [`DomainId::PRIORITY`] domain, which matches
//! every other domain during queue filtering.

/// Identifier of a locality domain: a group of execution contexts for which
/// lock hand-off is cheap relative to hand-off across groups (e.g. a shared
/// cache or a NUMA node).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DomainId(u32);

impl DomainId {
    /// The domain of callers that must not be penalized by queue reordering.
    ///
    /// Priority waiters match every domain during filtering, so they are
    /// never moved to a secondary queue.
    pub const PRIORITY: Self = Self(u32::MAX);

    /// Creates a new domain identifier.
    ///
    /// `u32::MAX` is reserved: constructing it yields [`DomainId::PRIORITY`].
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn into_raw(self) -> u32 {
        self.0
    }

    /// Rebuilds a domain identifier from its raw value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns `true` if this is the priority domain.
    #[must_use]
    pub const fn is_priority(self) -> bool {
        self.0 == u32::MAX
    }
}

/// Maps the current execution context to a locality domain and provides the
/// monotonic clock consumed by the fairness policy.
///
/// Locks are generic over this trait the same way they are generic over the
/// relax policy, so the classification strategy is chosen at the type level
/// and compiles down to a direct call.
pub trait Topology {
    /// Returns the locality domain of the calling execution context.
    ///
    /// Must be cheap and total, and must return a consistent id for a given
    /// context for the lifetime of the lock use.
    fn domain() -> DomainId;

    /// Returns a monotonic timestamp in nanoseconds.
    ///
    /// Only used to age secondary queues. A topology whose waiters are never
    /// filtered (see [`Flat`]) may simply return zero.
    fn timestamp() -> u64;
}

/// A topology that places every caller in the priority domain.
///
/// Queue filtering never triggers and the lock degenerates to a plain MCS
/// queue with strict FIFO hand-off. This is the only classification that is
/// available on every target, and the default for the policy alias modules.
pub struct Flat;

impl Topology for Flat {
    fn domain() -> DomainId {
        DomainId::PRIORITY
    }

    fn timestamp() -> u64 {
        0
    }
}

/// Locality classification by explicit, per-thread domain assignment.
///
/// Callers partition their threads into domains once, at thread start-up,
/// and the lock reads the assignment on every acquisition. Threads that
/// never call [`set_domain`] stay in the priority domain.
#[cfg(any(feature = "thread_local", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "thread_local")))]
pub mod threads {
    use core::cell::Cell;
    use std::sync::OnceLock;
    use std::time::Instant;

    use super::{DomainId, Topology};

    std::thread_local! {
        static DOMAIN: Cell<DomainId> = Cell::new(DomainId::PRIORITY);
    }

    /// Assigns the locality domain advertised by the current thread.
    ///
    /// Meant to be called once per thread, before the thread starts
    /// contending; reassigning mid-use is allowed but only affects future
    /// acquisitions.
    pub fn set_domain(domain: DomainId) {
        DOMAIN.with(|cell| cell.set(domain));
    }

    /// Returns the domain assigned to the current thread, or the priority
    /// domain if none was ever assigned.
    #[must_use]
    pub fn domain() -> DomainId {
        DOMAIN.with(Cell::get)
    }

    /// A topology backed by the thread-local domain assignment and the
    /// process monotonic clock.
    pub struct Threads;

    impl Topology for Threads {
        fn domain() -> DomainId {
            domain()
        }

        fn timestamp() -> u64 {
            static EPOCH: OnceLock<Instant> = OnceLock::new();
            EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
        }
    }
}

/// Locality classification from the machine's NUMA layout.
///
/// The domain of a thread is the NUMA node of the CPU it is currently
/// running on, resolved through `sched_getcpu` and the sysfs node topology.
/// The cpu-to-node map is built once and cached for the process lifetime.
///
/// Classification is only stable if threads are pinned to a CPU or at least
/// to a node; a migrating thread will start advertising its new node on its
/// next acquisition, which is benign but wastes filtering work.
#[cfg(all(feature = "numa", target_os = "linux"))]
#[cfg_attr(docsrs, doc(cfg(all(feature = "numa", target_os = "linux"))))]
pub mod numa {
    use std::fs;
    use std::path::Path;
    use std::sync::OnceLock;
    use std::vec::Vec;

    use super::{threads::Threads, DomainId, Topology};

    /// A topology that classifies threads by the NUMA node of the CPU they
    /// are currently running on.
    ///
    /// Falls back to the priority domain when the node layout cannot be
    /// determined (non-NUMA machine, sysfs unavailable), which disables
    /// filtering rather than misclassifying.
    pub struct Numa;

    impl Topology for Numa {
        fn domain() -> DomainId {
            current_node().unwrap_or(DomainId::PRIORITY)
        }

        fn timestamp() -> u64 {
            Threads::timestamp()
        }
    }

    /// Returns the NUMA node of the CPU currently executing the caller, if
    /// it can be determined.
    #[must_use]
    pub fn current_node() -> Option<DomainId> {
        // SAFETY: `sched_getcpu` has no preconditions, it only reads the
        // per-cpu area and reports failure through its return value.
        let cpu = unsafe { libc::sched_getcpu() };
        let true = cpu >= 0 else { return None };
        cpu_to_node().get(cpu as usize).copied().map(DomainId::new)
    }

    /// The cached cpu-to-node map, indexed by CPU number.
    fn cpu_to_node() -> &'static [u32] {
        static MAP: OnceLock<Vec<u32>> = OnceLock::new();
        MAP.get_or_init(|| build_map(Path::new("/sys/devices/system/node")))
    }

    /// Builds the cpu-to-node map from the sysfs node directories, each of
    /// which publishes the CPUs it owns as a `cpulist` range expression
    /// (e.g. `0-7,16-23`).
    fn build_map(nodes: &Path) -> Vec<u32> {
        let mut map = Vec::new();
        let Ok(entries) = fs::read_dir(nodes) else { return map };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(node) = name.strip_prefix("node") else { continue };
            let Ok(node) = node.parse::<u32>() else { continue };
            let Ok(list) = fs::read_to_string(entry.path().join("cpulist")) else { continue };
            for (start, end) in parse_cpulist(&list) {
                if map.len() <= end {
                    map.resize(end + 1, 0);
                }
                for cpu in start..=end {
                    map[cpu] = node;
                }
            }
        }
        map
    }

    /// Parses a sysfs `cpulist` expression into inclusive ranges.
    fn parse_cpulist(list: &str) -> impl Iterator<Item = (usize, usize)> + '_ {
        list.trim().split(',').filter_map(|range| {
            let mut ends = range.splitn(2, '-');
            let start = ends.next()?.trim().parse().ok()?;
            let end = match ends.next() {
                Some(end) => end.trim().parse().ok()?,
                None => start,
            };
            (start <= end).then_some((start, end))
        })
    }

    #[cfg(all(not(loom), test))]
    mod test {
        use super::parse_cpulist;

        #[test]
        fn parses_cpulist_ranges() {
            let ranges: Vec<_> = parse_cpulist("0-3,8,12-13\n").collect();
            assert_eq!(ranges, [(0, 3), (8, 8), (12, 13)]);
        }

        #[test]
        fn ignores_malformed_ranges() {
            let ranges: Vec<_> = parse_cpulist("0-1,x,5-2").collect();
            assert_eq!(ranges, [(0, 1)]);
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::threads;
    use super::{DomainId, Flat, Topology};

    #[test]
    fn priority_sentinel_is_reserved() {
        assert!(DomainId::PRIORITY.is_priority());
        assert!(DomainId::new(u32::MAX).is_priority());
        assert!(!DomainId::new(0).is_priority());
        assert_eq!(DomainId::from_raw(7), DomainId::new(7));
        assert_eq!(DomainId::new(7).into_raw(), 7);
    }

    #[test]
    fn flat_is_always_priority() {
        assert!(Flat::domain().is_priority());
        assert_eq!(Flat::timestamp(), 0);
    }

    #[test]
    fn thread_domain_defaults_to_priority() {
        std::thread::spawn(|| assert!(threads::domain().is_priority()))
            .join()
            .expect("thread::spawn failed");
    }

    #[test]
    fn thread_domain_is_per_thread() {
        threads::set_domain(DomainId::new(3));
        let other = std::thread::spawn(|| {
            threads::set_domain(DomainId::new(5));
            threads::domain()
        });
        assert_eq!(other.join().expect("thread::spawn failed"), DomainId::new(5));
        assert_eq!(threads::domain(), DomainId::new(3));
    }

    #[test]
    fn thread_clock_is_monotonic() {
        let first = threads::Threads::timestamp();
        let second = threads::Threads::timestamp();
        assert!(second >= first);
    }
}
