//! The closed set of traced operations and the table driving their shims.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Classification the policy engine filters on. `Malloc` and `Mmap` are the
/// only classes with per-type statistics; everything else is filtered out
/// of every mode except `full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Malloc,
    Mmap,
    Release,
    Lock,
    Aux,
}

impl SizeClass {
    /// Statistics slot for this class, if it has one.
    pub fn stat_slot(self) -> Option<usize> {
        match self {
            SizeClass::Malloc => Some(0),
            SizeClass::Mmap => Some(1),
            _ => None,
        }
    }
}

pub const STAT_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(usize)]
pub enum Event {
    Malloc,
    Calloc,
    Realloc,
    Free,
    Cfree,
    Memalign,
    PosixMemalign,
    AlignedAlloc,
    Valloc,
    Pvalloc,
    Memmove,
    Memset,
    Mmap,
    Munmap,
    Mmap2,
    Mlock,
    Munlock,
    Mlockall,
    Munlockall,
}

pub const EVENT_COUNT: usize = 19;

pub struct EventInfo {
    /// Tag used in the compact stream; the suffix character groups the
    /// operation family (`$` heap, `!` byte ops, `&` mappings, `#` locking).
    pub compact: &'static str,
    pub human: &'static str,
    pub class: SizeClass,
}

static EVENT_TABLE: [EventInfo; EVENT_COUNT] = [
    EventInfo { compact: "MA$", human: "malloc", class: SizeClass::Malloc },
    EventInfo { compact: "CA$", human: "calloc", class: SizeClass::Malloc },
    EventInfo { compact: "RE$", human: "realloc", class: SizeClass::Malloc },
    EventInfo { compact: "FR$", human: "free", class: SizeClass::Release },
    EventInfo { compact: "CF$", human: "cfree", class: SizeClass::Release },
    EventInfo { compact: "ME$", human: "memalign", class: SizeClass::Malloc },
    EventInfo { compact: "PO$", human: "posix_memalign", class: SizeClass::Malloc },
    EventInfo { compact: "AL$", human: "aligned_alloc", class: SizeClass::Malloc },
    EventInfo { compact: "VA$", human: "valloc", class: SizeClass::Malloc },
    EventInfo { compact: "PV$", human: "pvalloc", class: SizeClass::Malloc },
    EventInfo { compact: "MM!", human: "memmove", class: SizeClass::Aux },
    EventInfo { compact: "MS!", human: "memset", class: SizeClass::Malloc },
    EventInfo { compact: "MM&", human: "mmap", class: SizeClass::Mmap },
    EventInfo { compact: "MU&", human: "munmap", class: SizeClass::Release },
    EventInfo { compact: "MM2&", human: "mmap2", class: SizeClass::Mmap },
    EventInfo { compact: "ML#", human: "mlock", class: SizeClass::Lock },
    EventInfo { compact: "MU#", human: "munlock", class: SizeClass::Lock },
    EventInfo { compact: "MLA#", human: "mlockall", class: SizeClass::Lock },
    EventInfo { compact: "MUA#", human: "munlockall", class: SizeClass::Lock },
];

impl Event {
    pub fn info(self) -> &'static EventInfo {
        &EVENT_TABLE[usize::from(self)]
    }

    pub fn name(self, human_readable: bool) -> &'static str {
        let info = self.info();
        if human_readable {
            info.human
        } else {
            info.compact
        }
    }

    pub fn class(self) -> SizeClass {
        self.info().class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_every_event() {
        for i in 0..EVENT_COUNT {
            let ev = Event::try_from(i).unwrap();
            let info = ev.info();
            assert!(!info.compact.is_empty());
            assert!(!info.human.is_empty());
        }
        assert!(Event::try_from(EVENT_COUNT).is_err());
    }

    #[test]
    fn tags_match_the_stream_format() {
        assert_eq!(Event::Malloc.name(false), "MA$");
        assert_eq!(Event::Malloc.name(true), "malloc");
        assert_eq!(Event::Mmap2.name(false), "MM2&");
        assert_eq!(Event::Munlockall.name(false), "MUA#");
        assert_eq!(Event::Memset.name(false), "MS!");
        assert_eq!(Event::Memmove.name(false), "MM!");
    }

    #[test]
    fn classes_follow_the_operation_family() {
        assert_eq!(Event::Memset.class(), SizeClass::Malloc);
        assert_eq!(Event::Memmove.class(), SizeClass::Aux);
        assert_eq!(Event::Munmap.class(), SizeClass::Release);
        assert_eq!(Event::Mlockall.class(), SizeClass::Lock);
        assert_eq!(SizeClass::Malloc.stat_slot(), Some(0));
        assert_eq!(SizeClass::Mmap.stat_slot(), Some(1));
        assert_eq!(SizeClass::Release.stat_slot(), None);
    }
}
