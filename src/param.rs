/// maximum number of CPUs
pub const NCPU: usize = 8;
/// max # of blocks any FS op writes
pub const MAXOPBLOCKS: usize = 10;
/// size of disk block cache
pub const NBUF: usize = MAXOPBLOCKS * 3;
/// buffer cache hash buckets (prime)
pub const NBUCKET: usize = 17;
/// bytes per disk block
pub const BSIZE: usize = 1024;
/// bytes per physical page
pub const PGSIZE: usize = 4096;
