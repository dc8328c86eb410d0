//! Load and store lowering.

use glacier_ir::operand::Operand;
use glacier_ir::types::Type;
use glacier_ir::value::InstId;

use super::{Legal, TargetX86};

impl TargetX86<'_> {
    /// A load is an assignment from a memory operand. Address-mode
    /// optimization has usually produced the operand already.
    pub(crate) fn lower_load(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).dest.expect("load without dest");
        let addr = self.cfg.inst(iid).srcs[0];
        let mem = self.form_memory_operand(addr, true);
        self.lower_assign_like(dest, Operand::Mem(mem));
    }

    pub(crate) fn lower_store(&mut self, iid: InstId) {
        let value = self.cfg.inst(iid).srcs[0];
        let addr = self.cfg.inst(iid).srcs[1];
        let mem = self.form_memory_operand(addr, true);
        let ty = self.operand_type(value);
        if !self.config.is_64bit() && ty == Type::I64 {
            let value = self.legalize_undef(value, None);
            let value_hi = self.hi_operand(value);
            let value_lo = self.lo_operand(value);
            let value_hi = self.legalize(value_hi, Legal::REG | Legal::IMM, None);
            let value_lo = self.legalize(value_lo, Legal::REG | Legal::IMM, None);
            let mem_op = Operand::Mem(mem);
            let hi = self.hi_operand(mem_op).as_mem().unwrap();
            let lo = self.lo_operand(mem_op).as_mem().unwrap();
            self.store(value_hi, hi);
            self.store(value_lo, lo);
        } else if ty.is_vector() {
            let r = self.legalize_to_reg(value, None);
            self.storep(r, mem);
        } else if ty == Type::F64 {
            let r = self.legalize_to_reg(value, None);
            self.storeq(r, mem);
        } else {
            let value = self.legalize(value, Legal::REG | Legal::IMM, None);
            self.store(value, mem);
        }
    }
}
