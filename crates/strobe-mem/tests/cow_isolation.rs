use proptest::prelude::*;
use strobe_mem::SurfaceCache;

prop_compose! {
    fn arb_write(size: u64, instances: usize)(
        instance in 0..instances,
        offset in 0..(size - 4),
        value in any::<u32>(),
    ) -> (usize, u64, u32) {
        (instance, offset & !3, value)
    }
}

proptest! {
    // Writing any sequence of words through any instances never leaks into an
    // instance that was not written, and the written instance always reads
    // back the last value stored at each offset.
    #[test]
    fn writes_stay_instance_local(
        writes in proptest::collection::vec(arb_write(256, 4), 1..64),
    ) {
        let mut cache = SurfaceCache::new(4, 256);
        cache.fill(vec![0u8; 256]);

        // Shadow model: per-instance word map, all starting at zero.
        let mut model = vec![[0u32; 64]; 4];
        for &(instance, offset, value) in &writes {
            cache.write_u32_le(instance, offset, value).unwrap();
            model[instance][(offset / 4) as usize] = value;
        }

        for instance in 0..4 {
            for word in 0..64u64 {
                prop_assert_eq!(
                    cache.read_u32_le(instance, word * 4).unwrap(),
                    model[instance][word as usize]
                );
            }
        }
    }

    #[test]
    fn export_matches_reads(bytes in proptest::collection::vec(any::<u8>(), 1..512)) {
        let mut cache = SurfaceCache::new(2, bytes.len() as u64);
        cache.fill(bytes.clone());

        let exported = cache.export(0).unwrap();
        prop_assert_eq!(&exported, &bytes);

        // The sibling instance still owns the original content.
        let mut readback = vec![0u8; bytes.len()];
        cache.read_into(1, 0, &mut readback).unwrap();
        prop_assert_eq!(&readback, &bytes);
    }
}
