use proptest::prelude::*;
use strobe_reloc::{patch, FixedQuery, RelocBatch};
use strobe_trace::{
    Allocation, Combine, ContentKind, ModuleTable, Reloc, RelocKind, RelocSource, TraceModule,
};

fn table_with_word(old: u32) -> (ModuleTable, strobe_trace::ModuleId) {
    let mut table = ModuleTable::new();
    let mut m = TraceModule::new("m", ContentKind::Data, 4, 1);
    m.cache_mut().fill(old.to_le_bytes().to_vec());
    m.allocate(vec![Allocation {
        virt_addr: 0,
        size: 4,
        peer_addrs: vec![],
    }])
    .unwrap();
    let id = table.insert(m).unwrap();
    (table, id)
}

proptest! {
    // Overwrite mode: bits under the mask come from the new value, bits
    // outside it are preserved verbatim.
    #[test]
    fn overwrite_obeys_the_mask_algebra(old in any::<u32>(), new in any::<u32>(), mask in any::<u32>()) {
        prop_assume!(mask != 0);
        let (mut table, m) = table_with_word(old);

        let reloc = Reloc::new(0, RelocKind::Const32 { value: new }, RelocSource::Literal(new.into()))
            .with_mask(mask.into());
        let mut batch = RelocBatch::new();
        patch(&mut table, m, &reloc, 0, &mut batch, &FixedQuery::default()).unwrap();

        let got = table.get(m).unwrap().cache().read_u32_le(0, 0).unwrap();
        prop_assert_eq!(got, (old & !mask) | (new & mask));
    }

    // Add mode: the masked halves are summed (wrapping within the mask) and
    // bits outside the mask are still preserved.
    #[test]
    fn add_obeys_the_mask_algebra(old in any::<u32>(), new in any::<u32>(), mask in any::<u32>()) {
        prop_assume!(mask != 0);
        let (mut table, m) = table_with_word(old);

        let reloc = Reloc::new(0, RelocKind::Const32 { value: new }, RelocSource::Literal(new.into()))
            .with_mask(mask.into())
            .with_combine(Combine::Add);
        let mut batch = RelocBatch::new();
        patch(&mut table, m, &reloc, 0, &mut batch, &FixedQuery::default()).unwrap();

        let got = table.get(m).unwrap().cache().read_u32_le(0, 0).unwrap();
        let expect = (old & !mask) | ((old & mask).wrapping_add(new & mask) & mask);
        prop_assert_eq!(got, expect);
    }

    // Applying the same overwrite relocation twice never changes the result
    // of the first application.
    #[test]
    fn overwrite_is_idempotent(old in any::<u32>(), new in any::<u32>(), mask in any::<u32>()) {
        prop_assume!(mask != 0);
        let (mut table, m) = table_with_word(old);

        let reloc = Reloc::new(0, RelocKind::Const32 { value: new }, RelocSource::Literal(new.into()))
            .with_mask(mask.into());
        let mut batch = RelocBatch::new();
        patch(&mut table, m, &reloc, 0, &mut batch, &FixedQuery::default()).unwrap();
        let first = table.get(m).unwrap().cache().read_u32_le(0, 0).unwrap();
        patch(&mut table, m, &reloc, 0, &mut batch, &FixedQuery::default()).unwrap();
        let second = table.get(m).unwrap().cache().read_u32_le(0, 0).unwrap();
        prop_assert_eq!(first, second);
    }
}
