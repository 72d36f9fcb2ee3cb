/// A fixed block size and the most blocks one chunk of this class carves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
    pub block_size: usize,
    pub max_blocks_per_chunk: usize,
}

/// `(first, last, step, max_blocks_per_chunk)` for each tier.
const TIERS: [(usize, usize, usize, usize); 10] = [
    (16, 128, 16, 4096),
    (160, 512, 32, 2048),
    (576, 2048, 64, 1024),
    (2304, 8192, 256, 256),
    (9216, 16384, 1024, 128),
    (20480, 65536, 4096, 32),
    (81920, 262144, 16384, 8),
    (327680, 1 << 20, 65536, 4),
    (1310720, 4 << 20, 262144, 2),
    (5 << 20, 8 << 20, 1 << 20, 1),
];

const fn count_classes() -> usize {
    let mut n = 0;
    let mut t = 0;
    while t < TIERS.len() {
        let (first, last, step, _) = TIERS[t];
        n += (last - first) / step + 1;
        t += 1;
    }
    n
}

pub const NUM_SIZE_CLASSES: usize = count_classes();

const fn build_classes() -> [SizeClass; NUM_SIZE_CLASSES] {
    let mut table = [SizeClass {
        block_size: 0,
        max_blocks_per_chunk: 0,
    }; NUM_SIZE_CLASSES];
    let mut i = 0;
    let mut t = 0;
    while t < TIERS.len() {
        let (first, last, step, max_blocks) = TIERS[t];
        let mut size = first;
        while size <= last {
            table[i] = SizeClass {
                block_size: size,
                max_blocks_per_chunk: max_blocks,
            };
            i += 1;
            size += step;
        }
        t += 1;
    }
    table
}

/// Every size class, strictly ascending by block size.
pub static SIZE_CLASSES: [SizeClass; NUM_SIZE_CLASSES] = build_classes();

/// Largest request served from a size class.
pub const MAX_CLASS_SIZE: usize = build_classes()[NUM_SIZE_CLASSES - 1].block_size;

/// Alignment every size-classed block is guaranteed to have.
pub const CLASS_ALIGN: usize = 16;

const _: () = {
    let table = build_classes();
    let mut i = 0;
    while i < NUM_SIZE_CLASSES {
        assert!(table[i].block_size.is_multiple_of(CLASS_ALIGN));
        assert!(table[i].max_blocks_per_chunk > 0 && table[i].max_blocks_per_chunk <= u16::MAX as usize);
        if i > 0 {
            assert!(table[i - 1].block_size < table[i].block_size);
            assert!(table[i - 1].max_blocks_per_chunk >= table[i].max_blocks_per_chunk);
        }
        i += 1;
    }
    // Class indices are stored in a u8 lookup table.
    assert!(NUM_SIZE_CLASSES <= u8::MAX as usize);
};

/// Sizes up to this bound resolve through [`SIZE_CLASS_LUT`].
const LUT_LIMIT: usize = 2048;

/// O(1) size-to-class lookup for small sizes. Index by `ceil(size / 16)`.
static SIZE_CLASS_LUT: [u8; LUT_LIMIT / 16 + 1] = build_lut();

const fn build_lut() -> [u8; LUT_LIMIT / 16 + 1] {
    let classes = build_classes();
    let mut table = [0u8; LUT_LIMIT / 16 + 1];
    // table[0] unused (size 0 never reaches the classifier)
    let mut q = 1;
    let mut sc = 0;
    while q < table.len() {
        while classes[sc].block_size < q * 16 {
            sc += 1;
        }
        table[q] = sc as u8;
        q += 1;
    }
    table
}

/// Index of the smallest class whose block size is `>= size`, or `None` when
/// `size` is zero or above [`MAX_CLASS_SIZE`].
#[inline]
pub fn class_of(size: usize) -> Option<usize> {
    match size {
        0 => None,
        1..=LUT_LIMIT => Some(SIZE_CLASS_LUT[size.div_ceil(16)] as usize),
        _ if size > MAX_CLASS_SIZE => None,
        _ => Some(SIZE_CLASSES.partition_point(|c| c.block_size < size)),
    }
}
