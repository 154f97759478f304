//! Emitter for the measurement trampoline.
//!
//! The staging slot is only ever executed *speculatively*, in the shadow of
//! a mispredicted return:
//!
//! ```text
//! entry:
//!     mov     ecx, <counter>
//!     lea     r8, [pad_fn]
//!     movaps  xmm0, [r8]          ; pull the pad line back in
//!     movaps  [r8], xmm0
//!     sfence
//!     lfence
//!     rdpmc
//!     jmp     r8
//! .align 64
//! pad_fn:
//!     mov     r9d, eax
//!     call    delay               ; the RSB predicts a return to 'slot'
//! slot:
//!     <candidate> <filler> <tail> 0xce
//! delay:
//!     <long AVX dependency chain>
//!     lea     rax, [resume]
//!     xchg    [rsp], rax          ; the architectural return goes to 'resume'
//!     ret
//! resume:
//!     lfence
//!     rdpmc
//!     sub     eax, r9d
//!     ret
//! ```
//!
//! While the chain in `delay` is in flight, the front-end fetches and
//! decodes the slot. The trailing `0xce` stops the speculative stream before
//! it can run into the rest of the image. Nothing in the slot ever retires.

use dynasmrt::{
    dynasm, DynasmApi, DynasmLabelApi, VecAssembler,
    x64::X64Relocation,
};

use crate::error::{ HarnessError, Result };
use crate::pad::{ PadLayout, FAULT, FILLER };

/// Number of `vaddps`/`vsqrtpd` rounds in the delay chain.
const DELAY_ROUNDS: usize = 8;

/// Assembled trampoline, position-dependent on the base address it was
/// assembled for.
#[derive(Clone, Debug)]
pub struct TrampolineImage {
    pub bytes: Vec<u8>,
    /// Offset of the entrypoint
    pub entry: usize,
    /// Offset of the (cache-line aligned) function containing the slot
    pub pad_fn: usize,
    /// Offset of the staging slot
    pub slot: usize,
}

/// Assemble the trampoline for an arena mapped at `base`.
pub fn assemble_trampoline(base: usize, layout: PadLayout, counter_index: i32)
    -> Result<TrampolineImage>
{
    let mut ops: VecAssembler<X64Relocation> = VecAssembler::new(base);
    let pad_fn_lab = ops.new_dynamic_label();
    let delay_lab = ops.new_dynamic_label();
    let resume_lab = ops.new_dynamic_label();
    let scratch_lab = ops.new_dynamic_label();

    let entry = ops.offset().0;
    dynasm!(ops
        ; .arch x64
        ; mov ecx, counter_index
        ; lea r8, [=>pad_fn_lab]
        ; movaps xmm0, [r8]
        ; movaps [r8], xmm0
        ; sfence
        ; lfence
        ; rdpmc
        ; jmp r8
        ; .align 64
    );

    let pad_fn = ops.offset().0;
    dynasm!(ops
        ; =>pad_fn_lab
        ; mov r9d, eax
        ; call =>delay_lab
    );

    let slot = ops.offset().0;
    let mut initial = vec![FILLER; layout.padding_size];
    initial.extend(std::iter::repeat(FAULT).take(layout.tail_size + 1));
    dynasm!(ops
        ; .bytes &initial
    );

    dynasm!(ops
        ; =>delay_lab
        ; lea r10, [=>scratch_lab]
        ; vmovups ymm0, [r10]
        ; vmovups ymm1, [r10]
        ; vmovups ymm2, [r10]
        ; vmovups ymm3, [r10]
    );
    for _ in 0..DELAY_ROUNDS {
        dynasm!(ops
            ; vaddps ymm0, ymm1, [r10]
            ; vaddps ymm1, ymm2, [r10]
            ; vaddps ymm2, ymm3, [r10]
            ; vaddps ymm3, ymm0, [r10]
            ; vsqrtpd ymm0, ymm0
            ; vsqrtpd ymm1, ymm1
            ; vsqrtpd ymm2, ymm2
            ; vsqrtpd ymm3, ymm3
        );
    }
    dynasm!(ops
        ; lea rax, [=>resume_lab]
        ; xchg QWORD [rsp], rax
        ; ret
        ; int3
        ; .align 64
        ; =>resume_lab
        ; lfence
        ; rdpmc
        ; sub eax, r9d
        ; vzeroupper
        ; ret
        ; .align 64
        ; =>scratch_lab
        ; .bytes &[0u8; 64]
    );

    let bytes = ops.finalize()
        .map_err(|e| HarnessError::Assemble(format!("{:?}", e)))?;
    Ok(TrampolineImage { bytes, entry, pad_fn, slot })
}
