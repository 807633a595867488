#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rufs_ondisk::superblock::off;
use rufs_ondisk::{FS_44INODEFMT, FS_DYNAMICPOSTBLFMT, FS_MAGIC, SBSIZE, Superblock};
use rufs_types::{write_le_i32, write_le_i64, write_le_u32, write_le_u64};

fn sample_region() -> Vec<u8> {
    let mut region = vec![0_u8; SBSIZE];
    let put = |region: &mut Vec<u8>, offset: usize, value: i32| {
        write_le_i32(region, offset, value).expect("in range");
    };
    put(&mut region, off::SIZE, 1024);
    put(&mut region, off::NCG, 2);
    put(&mut region, off::BSIZE, 8192);
    put(&mut region, off::FSIZE, 1024);
    put(&mut region, off::FRAG, 8);
    put(&mut region, off::BMASK, -8192);
    put(&mut region, off::FMASK, -1024);
    put(&mut region, off::FSBTODB, 1);
    put(&mut region, off::NINDIR, 2048);
    put(&mut region, off::CSADDR, 88);
    put(&mut region, off::CSSIZE, 1024);
    put(&mut region, off::MAXSYMLINKLEN, 60);
    put(&mut region, off::INODEFMT, FS_44INODEFMT);
    write_le_u64(&mut region, off::MAXFILESIZE, 0x0000_0400_2000_7FFF).expect("in range");
    write_le_i64(&mut region, off::QBMASK, 8191).expect("in range");
    write_le_i64(&mut region, off::QFMASK, 1023).expect("in range");
    put(&mut region, off::POSTBLFORMAT, FS_DYNAMICPOSTBLFMT);
    put(&mut region, off::NRPOS, 8);
    region[off::CLEAN] = 1;
    write_le_u32(&mut region, off::MAGIC, FS_MAGIC).expect("in range");
    region
}

fn bench_superblock_parse(c: &mut Criterion) {
    let region = sample_region();
    c.bench_function("superblock_parse", |b| {
        b.iter(|| Superblock::parse(black_box(&region)).expect("parse"));
    });
}

fn bench_superblock_encode(c: &mut Criterion) {
    let region = sample_region();
    let mut sblock = Superblock::parse(&region).expect("parse");
    sblock.normalize();
    c.bench_function("superblock_encode", |b| {
        b.iter(|| black_box(&sblock).encode().expect("encode"));
    });
}

criterion_group!(benches, bench_superblock_parse, bench_superblock_encode);
criterion_main!(benches);
