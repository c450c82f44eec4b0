use serde::{Deserialize, Serialize};

/// Body of an RPC request.
///
/// `arguments` is the tuple of call arguments, encoded as a sequence in
/// declaration order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RpcRequest<A> {
    pub arguments: A,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Codec, JsonCodec, MsgPackCodec};

    #[test]
    fn test_request_wire_shape() {
        let request = RpcRequest {
            arguments: (2i32, 3i32),
        };
        let bytes = JsonCodec.serialize(&request).unwrap();
        assert_eq!(&bytes[..], br#"{"arguments":[2,3]}"#);

        let bytes = MsgPackCodec.serialize(&request).unwrap();
        let decoded: RpcRequest<(i32, i32)> = MsgPackCodec.deserialize(&bytes).unwrap();
        assert_eq!(decoded, request);

        let empty = JsonCodec.serialize(&RpcRequest { arguments: () }).unwrap();
        assert_eq!(&empty[..], br#"{"arguments":null}"#);
        let () = JsonCodec
            .deserialize::<RpcRequest<()>>(&empty)
            .unwrap()
            .arguments;
    }
}
