use proptest::prelude::*;
use serde_json::Value;
use wptnn_core::{
    builder::GraphBuilder,
    tensor::{decode_i64, decode_u64, encode_i64, encode_u64, DataType, TensorDescriptor},
    verify::ulp_distance,
};

proptest! {
    #[test]
    fn prop_int64_strings_roundtrip(x in any::<i64>(), y in any::<u64>()) {
        prop_assert_eq!(decode_i64(&encode_i64(x)).unwrap(), x);
        prop_assert_eq!(decode_u64(&encode_u64(y)).unwrap(), y);
    }

    #[test]
    fn prop_ulp_distance_is_symmetric(a in -1.0e30f32..1.0e30f32, b in -1.0e30f32..1.0e30f32) {
        prop_assert_eq!(ulp_distance(a, b), ulp_distance(b, a));
        prop_assert_eq!(ulp_distance(a, a), 0.0);
    }

    #[test]
    fn prop_node_ids_follow_source_order(ops in prop::collection::vec(0usize..3, 0..12)) {
        let mut b = GraphBuilder::new();
        let mut last = b
            .input("x", TensorDescriptor::new(DataType::Float32, vec![2]))
            .unwrap();
        for op in &ops {
            last = match op {
                0 => b.relu(last).unwrap(),
                1 => b.add(last, last).unwrap(),
                _ => b.invoke("neg", vec![last.into()]).unwrap(),
            };
        }
        let graph = b.build(&[]).unwrap();
        prop_assert_eq!(graph.document.nodes.len(), ops.len());
        for (i, node) in graph.document.nodes.iter().enumerate() {
            prop_assert_eq!(&node.id, &format!("op_{i}"));
        }
    }

    #[test]
    fn prop_single_value_expands(value in -1000i32..1000, dims in prop::collection::vec(1usize..4, 0..3)) {
        let res = wptnn_core::resources::GraphResources::from_fixture(&serde_json::json!({
            "inputs": {"x": {"data": value, "descriptor": {"shape": dims, "dataType": "int32"}}},
            "operators": []
        }))
        .unwrap();
        let graph = wptnn_core::normalize::normalize(&res).unwrap();
        let x = &graph.inputs["x"];
        prop_assert_eq!(Some(x.data.len()), x.descriptor.element_count());
        prop_assert!(x.data.iter().all(|v| *v == Value::from(value)));
    }
}
