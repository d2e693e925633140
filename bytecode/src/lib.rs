mod op;
mod instruction;
mod builder;
mod decoder;
pub mod printer;

pub use op::{Op, SPECIAL_SELECTORS, special_selector_arity};
pub use instruction::{Constant, Instruction};
pub use builder::{BytecodeBuilder, ClosureLabel, Label};
pub use decoder::{BytecodeDecoder, decode_at};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::{describe, listing, Indices};

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes).collect()
    }

    // ── Reference sequences ────────────────────────────────────────

    #[test]
    fn if_nil_sequence() {
        // (1 ifNil: [true]) class
        let bytes = [0x76, 0x88, 0x73, 0xc6, 0x99, 0x87, 0x71, 0xc7, 0x87, 0x78];
        let decoded = decode_all(&bytes);
        assert_eq!(decoded, vec![
            Instruction::PushConstant { value: Constant::Int(1) },
            Instruction::Dup,
            Instruction::PushConstant { value: Constant::Nil },
            Instruction::SpecialSend { index: 22 },
            Instruction::JumpIfFalse { offset: 2 },
            Instruction::Pop,
            Instruction::PushConstant { value: Constant::True },
            Instruction::SpecialSend { index: 23 },
            Instruction::Pop,
            Instruction::ReturnReceiver,
        ]);
        assert_eq!(decoded[3].to_string(), "send: ==");
        assert_eq!(decoded[7].to_string(), "send: class");
    }

    #[test]
    fn closure_listing() {
        let bytes = [0x70, 0x68, 0x10, 0x8F, 0x10, 0x00, 0x02, 0x10, 0x7D, 0xC9, 0x7C];
        let literals: Vec<&str> = Vec::new();
        assert_eq!(listing(&bytes, &literals), [
            "1 <70> self",
            "2 <68> popIntoTemp: 0",
            "3 <10> pushTemp: 0",
            "4 <8F 10 00 02> closureNumCopied: 1 numArgs: 0 bytes 7 to 9",
            "5  <10> pushTemp: 0",
            "6  <7D> blockReturn",
            "7 <C9> send: value",
            "8 <7C> returnTop",
        ].join("\n"));
    }

    #[test]
    fn every_opcode_family_listing() {
        let bytes: Vec<u8> = vec![
            15, 31, 32, 95, 96, 97, 98, 99, 103, 111, 112, 113, 114, 115, 116,
            117, 118, 119, 120, 121, 122, 123, 124, 126, 127,
            128, 31,
            129, 31,
            130, 31,
            131, 32,
            132, 31, 1,
            133, 32,
            134, 1,
            135,
            136,
            137,
            138, 31,
            139, 31, 0,
            140, 31, 56,
            141, 31, 56,
            142, 31, 56,
            143, 31, 63, 127,
            151,
            159,
            167, 31,
            171, 31,
            175, 31,
            125,
            176, 177, 178, 179, 180, 181, 182, 183, 184, 185, 186, 187, 188,
            189, 190, 191, 192, 193, 194, 195, 196, 197, 198, 199, 200, 201,
            202, 203, 204, 205, 206, 207, 208, 225, 240,
        ];
        let literals = vec!["someSelector", "someOtherSelector", "63"];
        let expected = [
            "1 <0F> pushRcvr: 15",
            "2 <1F> pushTemp: 15",
            "3 <20> pushConstant: someSelector",
            "4 <5F> pushLit: 31",
            "5 <60> popIntoRcvr: 0",
            "6 <61> popIntoRcvr: 1",
            "7 <62> popIntoRcvr: 2",
            "8 <63> popIntoRcvr: 3",
            "9 <67> popIntoRcvr: 7",
            "10 <6F> popIntoTemp: 7",
            "11 <70> self",
            "12 <71> pushConstant: true",
            "13 <72> pushConstant: false",
            "14 <73> pushConstant: nil",
            "15 <74> pushConstant: -1",
            "16 <75> pushConstant: 0",
            "17 <76> pushConstant: 1",
            "18 <77> pushConstant: 2",
            "19 <78> returnSelf",
            "20 <79> return: true",
            "21 <7A> return: false",
            "22 <7B> return: nil",
            "23 <7C> returnTop",
            "24 <7E> unknown: 126",
            "25 <7F> unknown: 127",
            "26 <80 1F> pushRcvr: 31",
            "27 <81 1F> storeIntoRcvr: 31",
            "28 <82 1F> popIntoRcvr: 31",
            "29 <83 20> send: someSelector",
            "30 <84 1F 01> send: someOtherSelector",
            "31 <85 20> sendSuper: someSelector",
            "32 <86 01> send: someOtherSelector",
            "33 <87> pop",
            "34 <88> dup",
            "35 <89> pushThisContext:",
            "36 <8A 1F> push: (Array new: 31)",
            "37 <8B 1F 00> callPrimitive: 31",
            "38 <8C 1F 38> pushTemp: 31 inVectorAt: 56",
            "39 <8D 1F 38> storeIntoTemp: 31 inVectorAt: 56",
            "40 <8E 1F 38> popIntoTemp: 31 inVectorAt: 56",
            "41 <8F 1F 3F 7F> closureNumCopied: 1 numArgs: 15 bytes 61 to 16316",
            "42  <97> jumpTo: 8",
            "43  <9F> jumpFalse: 8",
            "44  <A7 1F> jumpTo: 799",
            "45  <AB 1F> jumpTrue: 799",
            "46  <AF 1F> jumpFalse: 799",
            "47  <7D> blockReturn",
            "48 <B0> send: +",
            "49 <B1> send: -",
            "50 <B2> send: <",
            "51 <B3> send: >",
            "52 <B4> send: <=",
            "53 <B5> send: >=",
            "54 <B6> send: =",
            "55 <B7> send: ~=",
            "56 <B8> send: *",
            "57 <B9> send: /",
            "58 <BA> send: \\\\",
            "59 <BB> send: @",
            "60 <BC> send: bitShift:",
            "61 <BD> send: //",
            "62 <BE> send: bitAnd:",
            "63 <BF> send: bitOr:",
            "64 <C0> send: at:",
            "65 <C1> send: at:put:",
            "66 <C2> send: size",
            "67 <C3> send: next",
            "68 <C4> send: nextPut:",
            "69 <C5> send: atEnd",
            "70 <C6> send: ==",
            "71 <C7> send: class",
            "72 <C8> send: blockCopy:",
            "73 <C9> send: value",
            "74 <CA> send: value:",
            "75 <CB> send: do:",
            "76 <CC> send: new",
            "77 <CD> send: new:",
            "78 <CE> send: x",
            "79 <CF> send: y",
            "80 <D0> send: someSelector",
            "81 <E1> send: someOtherSelector",
            "82 <F0> send: someSelector",
        ];
        assert_eq!(listing(&bytes, &literals), expected.join("\n"));
    }

    // ── Decoding details ───────────────────────────────────────────

    #[test]
    fn widths_and_successors() {
        let bytes = [0x8F, 0x21, 0x00, 0x03, 0x10, 0x11, 0x7D, 0xA3, 0x05];
        assert_eq!(decode_at(&bytes, 0), (
            Instruction::PushClosure { num_copied: 2, num_args: 1, block_size: 3 },
            4,
        ));
        assert_eq!(decode_at(&bytes, 6), (Instruction::BlockReturn, 7));
        let (jump, next) = decode_at(&bytes, 7);
        assert_eq!(jump, Instruction::Jump { offset: -251 });
        assert_eq!(next, 9);
        assert_eq!(jump.jump_target(next), None);
    }

    #[test]
    fn jump_targets() {
        let (short, next) = decode_at(&[0x93], 0);
        assert_eq!(short, Instruction::Jump { offset: 4 });
        assert_eq!(short.jump_target(next), Some(5));

        let (back, next) = decode_at(&[0x87, 0x87, 0xA3, 0xFC], 2);
        assert_eq!(back, Instruction::Jump { offset: -4 });
        assert_eq!(back.jump_target(next), Some(0));
    }

    #[test]
    fn truncated_instruction_is_unknown() {
        assert_eq!(decode_all(&[0x84, 0x20]), vec![Instruction::Unknown { byte: 0x84 }]);
        assert_eq!(decode_all(&[0x76, 0x8F, 0x00]), vec![
            Instruction::PushConstant { value: Constant::Int(1) },
            Instruction::Unknown { byte: 0x8F },
        ]);
    }

    #[test]
    fn store_into_literal_constant_is_unknown() {
        assert_eq!(decode_at(&[0x81, 0x85], 0), (Instruction::Unknown { byte: 0x81 }, 2));
        assert_eq!(decode_at(&[0x82, 0x80], 0), (Instruction::Unknown { byte: 0x82 }, 2));
    }

    #[test]
    fn double_extended_operations() {
        assert_eq!(decode_all(&[
            0x84, 0x40, 200,
            0x84, 0x60, 100,
            0x84, 0x80, 70,
            0x84, 0xA0, 250,
            0x84, 0xC0, 251,
            0x84, 0xE0, 99,
            0x84, 0x23, 7,
        ]), vec![
            Instruction::PushReceiverVariable { index: 200 },
            Instruction::PushLiteralConstant { index: 100 },
            Instruction::PushLiteralVariable { index: 70 },
            Instruction::StoreReceiverVariable { index: 250, pop: false },
            Instruction::StoreReceiverVariable { index: 251, pop: true },
            Instruction::StoreLiteralVariable { index: 99, pop: false },
            Instruction::SuperSend { literal: 7, num_args: 3 },
        ]);
    }

    // ── Builder round trips ────────────────────────────────────────

    #[test]
    fn round_trip_short_forms() {
        let mut b = BytecodeBuilder::new();
        b.push_receiver_variable(3);
        b.push_temporary(9);
        b.push_literal_constant(31);
        b.push_literal_variable(2);
        b.store_receiver_variable(7, true);
        b.store_temporary(1, true);
        b.push_receiver();
        b.push_constant(Constant::Int(-1));
        b.send(4, 2);
        b.special_send(0);
        b.dup();
        b.pop();
        b.return_constant(Constant::False);
        b.return_top();

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::PushReceiverVariable { index: 3 },
            Instruction::PushTemporary { index: 9 },
            Instruction::PushLiteralConstant { index: 31 },
            Instruction::PushLiteralVariable { index: 2 },
            Instruction::StoreReceiverVariable { index: 7, pop: true },
            Instruction::StoreTemporary { index: 1, pop: true },
            Instruction::PushReceiver,
            Instruction::PushConstant { value: Constant::Int(-1) },
            Instruction::Send { literal: 4, num_args: 2 },
            Instruction::SpecialSend { index: 0 },
            Instruction::Dup,
            Instruction::Pop,
            Instruction::ReturnConstant { value: Constant::False },
            Instruction::ReturnTop,
        ]);
    }

    #[test]
    fn round_trip_extended_forms() {
        let mut b = BytecodeBuilder::new();
        b.push_receiver_variable(40);
        b.push_receiver_variable(120);
        b.push_literal_constant(50);
        b.store_temporary(20, false);
        b.store_literal_variable(5, true);
        b.store_receiver_variable(12, false);
        b.send(20, 3);
        b.send(40, 1);
        b.super_send(2, 1);
        b.push_new_array(5, true);
        b.push_remote_temp(1, 4);
        b.store_remote_temp(0, 4, true);
        b.call_primitive(513);
        b.push_active_context();

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::PushReceiverVariable { index: 40 },
            Instruction::PushReceiverVariable { index: 120 },
            Instruction::PushLiteralConstant { index: 50 },
            Instruction::StoreTemporary { index: 20, pop: false },
            Instruction::StoreLiteralVariable { index: 5, pop: true },
            Instruction::StoreReceiverVariable { index: 12, pop: false },
            Instruction::Send { literal: 20, num_args: 3 },
            Instruction::Send { literal: 40, num_args: 1 },
            Instruction::SuperSend { literal: 2, num_args: 1 },
            Instruction::PushNewArray { size: 5, pop_into: true },
            Instruction::PushRemoteTemp { index: 1, vector: 4 },
            Instruction::StoreRemoteTemp { index: 0, vector: 4, pop: true },
            Instruction::CallPrimitive { index: 513 },
            Instruction::PushActiveContext,
        ]);
    }

    #[test]
    fn forward_and_backward_jumps() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.push_temporary(0);
        let exit = b.jump_if_false();
        b.push_constant(Constant::Int(1));
        b.pop();
        b.jump_back(top);
        b.bind(exit);
        b.return_receiver();
        let bytes = b.into_bytes();

        assert_eq!(decode_all(&bytes), vec![
            Instruction::PushTemporary { index: 0 },
            Instruction::JumpIfFalse { offset: 4 },
            Instruction::PushConstant { value: Constant::Int(1) },
            Instruction::Pop,
            Instruction::Jump { offset: -7 },
            Instruction::ReturnReceiver,
        ]);
        let (back, next) = decode_at(&bytes, 5);
        assert_eq!(back.jump_target(next), Some(top));
    }

    #[test]
    fn closure_size_is_patched() {
        let mut b = BytecodeBuilder::new();
        let block = b.push_closure(0, 1);
        b.push_temporary(0);
        b.block_return();
        b.end_closure(block);
        b.return_top();

        let bytes = b.into_bytes();
        assert_eq!(decode_at(&bytes, 0).0, Instruction::PushClosure {
            num_copied: 0,
            num_args: 1,
            block_size: 2,
        });
        assert_eq!(decode_at(&bytes, 6).0, Instruction::ReturnTop);
    }

    #[test]
    fn temporary_63_uses_the_extended_form() {
        let mut b = BytecodeBuilder::new();
        b.push_temporary(63);
        b.store_temporary(63, false);
        let bytes = b.into_bytes();
        assert_eq!(decode_all(&bytes), vec![
            Instruction::PushTemporary { index: 63 },
            Instruction::StoreTemporary { index: 63, pop: false },
        ]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "temporary index out of range")]
    fn push_temporary_past_63_panics() {
        BytecodeBuilder::new().push_temporary(64);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "temporary index out of range")]
    fn store_temporary_past_63_panics() {
        BytecodeBuilder::new().store_temporary(64, true);
    }

    // ── Printing ───────────────────────────────────────────────────

    #[test]
    fn describe_resolves_literals() {
        let names = vec!["foo", "bar:"];
        let send = Instruction::Send { literal: 1, num_args: 1 };
        assert_eq!(describe(&send, 0, &names), "send: bar:");
        assert_eq!(describe(&send, 0, &Indices), "send: 1");
        assert_eq!(
            Instruction::StoreLiteralVariable { index: 0, pop: true }.to_string(),
            "popIntoLit: 0"
        );
        assert_eq!(Instruction::Unknown { byte: 126 }.to_string(), "unknown: 126");
    }

    #[test]
    fn special_selector_arities() {
        assert_eq!(special_selector_arity(17), 2);
        assert_eq!(special_selector_arity(25), 0);
        assert_eq!(Instruction::SpecialSend { index: 26 }.send_arity(), Some(1));
    }
}
