//! Value stamps: the abstract domain attached to every graph value.
//!
//! A stamp bounds the runtime values a node can produce. Stamps form a
//! join-semilattice per kind:
//! - **meet** widens: the stamp of a merge point admits every value either
//!   input admits
//! - **join** narrows: combining two facts about the same value admits only
//!   values both admit
//! - [`Stamp::is_empty`] means no value satisfies the facts; the node is
//!   unreachable
//! - unrestricted stamps admit every value of their kind
//!
//! Integer stamps track signed bounds plus two bit masks
//! (`must_be_set`/`may_be_set`); bounds and masks refine each other, so a
//! collapsed range always normalizes to a singleton that the canonicalizer
//! can turn into a constant.

// =============================================================================
// Scalar kinds
// =============================================================================

/// Primitive value kinds, used by ops that need a kind without a full stamp
/// (box kinds, array element kinds, conversions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValKind {
    I32,
    I64,
    F32,
    F64,
    Ref,
}

impl ValKind {
    pub fn unrestricted(self) -> Stamp {
        match self {
            ValKind::I32 => Stamp::Int(IntStamp::unrestricted(32)),
            ValKind::I64 => Stamp::Int(IntStamp::unrestricted(64)),
            ValKind::F32 => Stamp::Float(FloatStamp::unrestricted(32)),
            ValKind::F64 => Stamp::Float(FloatStamp::unrestricted(64)),
            ValKind::Ref => Stamp::Ref(RefStamp::unrestricted()),
        }
    }
}

/// Runtime-assigned class handle. The middle-end never inspects class
/// structure beyond identity; field counts travel on the allocation ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "class{}", self.0)
    }
}

// =============================================================================
// Integer stamps
// =============================================================================

/// How many bounds<->masks refinement rounds `IntStamp::create` runs before
/// settling; each round is monotonic so a small limit is enough.
const REFINE_LIMIT: usize = 3;

/// Signed integer range plus bit-presence masks.
///
/// Values are stored sign-extended to `i64` regardless of `bits`; masks
/// cover only the low `bits` bits. Invariants (enforced by [`IntStamp::create`]):
/// `lo <= hi`, `must_be_set` a subset of `may_be_set`, and both constants of a singleton
/// range agree with the masks. A violated invariant collapses to the empty
/// stamp instead of propagating nonsense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntStamp {
    bits: u8,
    lo: i64,
    hi: i64,
    must_be_set: u64,
    may_be_set: u64,
}

const fn int_min(bits: u8) -> i64 {
    if bits == 64 {
        i64::MIN
    } else {
        -(1i64 << (bits - 1))
    }
}

const fn int_max(bits: u8) -> i64 {
    if bits == 64 {
        i64::MAX
    } else {
        (1i64 << (bits - 1)) - 1
    }
}

const fn bits_mask(bits: u8) -> u64 {
    if bits == 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Truncate to `bits` then sign-extend back to i64.
const fn sign_extend(bits: u8, v: i64) -> i64 {
    if bits == 64 {
        v
    } else {
        let shift = 64 - bits as u32;
        ((v as u64 & bits_mask(bits)) as i64) << shift >> shift
    }
}

impl IntStamp {
    pub fn unrestricted(bits: u8) -> IntStamp {
        IntStamp {
            bits,
            lo: int_min(bits),
            hi: int_max(bits),
            must_be_set: 0,
            may_be_set: bits_mask(bits),
        }
    }

    /// The contradiction stamp: no integer satisfies it.
    pub fn empty(bits: u8) -> IntStamp {
        IntStamp {
            bits,
            lo: int_max(bits),
            hi: int_min(bits),
            must_be_set: bits_mask(bits),
            may_be_set: 0,
        }
    }

    pub fn constant(bits: u8, value: i64) -> IntStamp {
        let v = sign_extend(bits, value);
        let m = (v as u64) & bits_mask(bits);
        IntStamp {
            bits,
            lo: v,
            hi: v,
            must_be_set: m,
            may_be_set: m,
        }
    }

    /// Stamp for `[lo, hi]` with masks derived from the bounds.
    pub fn range(bits: u8, lo: i64, hi: i64) -> IntStamp {
        let (must, may) = Self::masks_from_bounds(bits, lo, hi);
        Self::create(bits, lo, hi, must, may)
    }

    /// The `{0, 1}` stamp produced by compares and instanceof.
    pub fn bool_range() -> IntStamp {
        Self::range(32, 0, 1)
    }

    /// Bits shared by every value in `[lo, hi]`: the common high prefix is
    /// fixed, everything below the highest differing bit can vary.
    fn masks_from_bounds(bits: u8, lo: i64, hi: i64) -> (u64, u64) {
        let mask = bits_mask(bits);
        if lo > hi {
            return (mask, 0);
        }
        if lo == hi {
            let v = (lo as u64) & mask;
            return (v, v);
        }
        if lo >= 0 || hi < 0 {
            let xor = ((lo ^ hi) as u64) & mask;
            let var_bits = 64 - xor.leading_zeros();
            let low_mask = if var_bits >= 64 {
                u64::MAX
            } else {
                (1u64 << var_bits) - 1
            };
            let prefix = (lo as u64) & mask & !low_mask;
            (prefix, (prefix | low_mask) & mask)
        } else {
            // Range crosses the sign change; every bit pattern is possible.
            (0, mask)
        }
    }

    /// Normalizing constructor: clamps to `bits`, lets bounds and masks
    /// refine each other, and collapses contradictions to [`IntStamp::empty`].
    pub fn create(bits: u8, lo: i64, hi: i64, must_be_set: u64, may_be_set: u64) -> IntStamp {
        debug_assert!(bits == 32 || bits == 64);
        let mask = bits_mask(bits);
        let mut lo = lo.max(int_min(bits));
        let mut hi = hi.min(int_max(bits));
        let mut must = must_be_set & mask;
        let mut may = may_be_set & mask;

        for _ in 0..REFINE_LIMIT {
            if lo > hi || must & !may != 0 {
                return Self::empty(bits);
            }
            let mut changed = false;

            // Masks constrain bounds when the range stays on one side of zero.
            if lo >= 0 {
                // Smallest nonneg value with all `must` bits: `must` itself;
                // largest value within `may`: `may` (when it fits positive).
                let must_v = sign_extend(bits, must as i64);
                if must_v >= 0 && must_v > lo {
                    lo = must_v;
                    changed = true;
                }
                let may_v = sign_extend(bits, may as i64);
                if may_v >= 0 && may_v < hi {
                    hi = may_v;
                    changed = true;
                }
            }

            // Bounds constrain masks.
            let (bm_must, bm_may) = Self::masks_from_bounds(bits, lo, hi);
            if must | bm_must != must {
                must |= bm_must;
                changed = true;
            }
            if may & bm_may != may {
                may &= bm_may;
                changed = true;
            }

            if !changed {
                break;
            }
        }

        if lo > hi || must & !may != 0 {
            return Self::empty(bits);
        }
        IntStamp {
            bits,
            lo,
            hi,
            must_be_set: must,
            may_be_set: may,
        }
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn lo(&self) -> i64 {
        self.lo
    }

    pub fn hi(&self) -> i64 {
        self.hi
    }

    pub fn must_be_set(&self) -> u64 {
        self.must_be_set
    }

    pub fn may_be_set(&self) -> u64 {
        self.may_be_set
    }

    pub fn is_empty(&self) -> bool {
        self.lo > self.hi || self.must_be_set & !self.may_be_set != 0
    }

    pub fn is_unrestricted(&self) -> bool {
        *self == Self::unrestricted(self.bits)
    }

    pub fn as_constant(&self) -> Option<i64> {
        if self.lo == self.hi && !self.is_empty() {
            Some(self.lo)
        } else {
            None
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        let v = sign_extend(self.bits, value);
        let uv = (v as u64) & bits_mask(self.bits);
        self.lo <= v && v <= self.hi && uv & self.must_be_set == self.must_be_set && uv & !self.may_be_set == 0
    }

    /// Union: admits everything either stamp admits.
    pub fn meet(&self, other: &IntStamp) -> IntStamp {
        debug_assert_eq!(self.bits, other.bits);
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        IntStamp::create(
            self.bits,
            self.lo.min(other.lo),
            self.hi.max(other.hi),
            self.must_be_set & other.must_be_set,
            self.may_be_set | other.may_be_set,
        )
    }

    /// Intersection: admits only what both stamps admit; may come out empty.
    pub fn join(&self, other: &IntStamp) -> IntStamp {
        debug_assert_eq!(self.bits, other.bits);
        IntStamp::create(
            self.bits,
            self.lo.max(other.lo),
            self.hi.min(other.hi),
            self.must_be_set | other.must_be_set,
            self.may_be_set & other.may_be_set,
        )
    }

    /// True when every value of `self` is below every value of `other`.
    pub fn always_lt(&self, other: &IntStamp) -> bool {
        !self.is_empty() && !other.is_empty() && self.hi < other.lo
    }

    /// True when no value can be common to both stamps.
    pub fn never_eq(&self, other: &IntStamp) -> bool {
        !self.is_empty() && !other.is_empty() && self.join(other).is_empty()
    }

    // -------------------------------------------------------------------------
    // Transfer functions (sound, conservative on overflow)
    // -------------------------------------------------------------------------

    pub fn add(&self, other: &IntStamp) -> IntStamp {
        if self.is_empty() || other.is_empty() {
            return Self::empty(self.bits);
        }
        match (self.lo.checked_add(other.lo), self.hi.checked_add(other.hi)) {
            (Some(lo), Some(hi))
                if lo >= int_min(self.bits) && hi <= int_max(self.bits) =>
            {
                Self::range(self.bits, lo, hi)
            }
            _ => Self::unrestricted(self.bits),
        }
    }

    pub fn sub(&self, other: &IntStamp) -> IntStamp {
        if self.is_empty() || other.is_empty() {
            return Self::empty(self.bits);
        }
        match (self.lo.checked_sub(other.hi), self.hi.checked_sub(other.lo)) {
            (Some(lo), Some(hi))
                if lo >= int_min(self.bits) && hi <= int_max(self.bits) =>
            {
                Self::range(self.bits, lo, hi)
            }
            _ => Self::unrestricted(self.bits),
        }
    }

    pub fn mul(&self, other: &IntStamp) -> IntStamp {
        if self.is_empty() || other.is_empty() {
            return Self::empty(self.bits);
        }
        let combos = [
            (self.lo as i128) * (other.lo as i128),
            (self.lo as i128) * (other.hi as i128),
            (self.hi as i128) * (other.lo as i128),
            (self.hi as i128) * (other.hi as i128),
        ];
        let lo = combos.iter().copied().min().unwrap_or(0);
        let hi = combos.iter().copied().max().unwrap_or(0);
        if lo >= int_min(self.bits) as i128 && hi <= int_max(self.bits) as i128 {
            Self::range(self.bits, lo as i64, hi as i64)
        } else {
            Self::unrestricted(self.bits)
        }
    }

    pub fn neg(&self) -> IntStamp {
        if self.is_empty() {
            return *self;
        }
        if self.lo == int_min(self.bits) {
            // -MIN wraps; give up precision rather than lie.
            return Self::unrestricted(self.bits);
        }
        Self::range(self.bits, -self.hi, -self.lo)
    }

    pub fn and(&self, other: &IntStamp) -> IntStamp {
        if self.is_empty() || other.is_empty() {
            return Self::empty(self.bits);
        }
        let must = self.must_be_set & other.must_be_set;
        let may = self.may_be_set & other.may_be_set;
        Self::from_masks(self.bits, must, may)
    }

    pub fn or(&self, other: &IntStamp) -> IntStamp {
        if self.is_empty() || other.is_empty() {
            return Self::empty(self.bits);
        }
        let must = self.must_be_set | other.must_be_set;
        let may = self.may_be_set | other.may_be_set;
        Self::from_masks(self.bits, must, may)
    }

    pub fn xor(&self, other: &IntStamp) -> IntStamp {
        if self.is_empty() || other.is_empty() {
            return Self::empty(self.bits);
        }
        let must = (self.must_be_set & !other.may_be_set) | (other.must_be_set & !self.may_be_set);
        let may = (self.may_be_set | other.may_be_set) & !(self.must_be_set & other.must_be_set);
        Self::from_masks(self.bits, must, may)
    }

    pub fn not(&self) -> IntStamp {
        if self.is_empty() {
            return *self;
        }
        let mask = bits_mask(self.bits);
        Self::from_masks(self.bits, !self.may_be_set & mask, !self.must_be_set & mask)
    }

    pub fn shl(&self, shift: &IntStamp) -> IntStamp {
        if self.is_empty() || shift.is_empty() {
            return Self::empty(self.bits);
        }
        let shift_mask = (self.bits - 1) as i64;
        match shift.as_constant() {
            Some(s) => {
                let s = (s & shift_mask) as u32;
                let lo = self.lo.checked_shl(s).filter(|v| v >> s == self.lo);
                let hi = self.hi.checked_shl(s).filter(|v| v >> s == self.hi);
                match (lo, hi) {
                    (Some(lo), Some(hi))
                        if lo >= int_min(self.bits) && hi <= int_max(self.bits) =>
                    {
                        Self::range(self.bits, lo, hi)
                    }
                    _ => Self::unrestricted(self.bits),
                }
            }
            None => Self::unrestricted(self.bits),
        }
    }

    pub fn shr(&self, shift: &IntStamp) -> IntStamp {
        if self.is_empty() || shift.is_empty() {
            return Self::empty(self.bits);
        }
        let shift_mask = (self.bits - 1) as i64;
        match shift.as_constant() {
            Some(s) => {
                let s = (s & shift_mask) as u32;
                Self::range(self.bits, self.lo >> s, self.hi >> s)
            }
            None => {
                // Unknown shift amount: values move toward 0 (nonnegative)
                // or -1 (negative), never past them.
                let lo = if self.lo < 0 { self.lo } else { 0 };
                let hi = if self.hi >= 0 { self.hi } else { -1 };
                Self::range(self.bits, lo, hi)
            }
        }
    }

    pub fn ushr(&self, shift: &IntStamp) -> IntStamp {
        if self.is_empty() || shift.is_empty() {
            return Self::empty(self.bits);
        }
        let mask = bits_mask(self.bits);
        let shift_mask = (self.bits - 1) as i64;
        match shift.as_constant() {
            Some(s) => {
                let s = (s & shift_mask) as u32;
                if s == 0 {
                    return *self;
                }
                if self.lo < 0 && self.hi >= 0 {
                    // Sign split: result spans [0, mask >> s].
                    return Self::range(self.bits, 0, (mask >> s) as i64);
                }
                // Same-sign range: unsigned order matches signed order, so
                // the shifted endpoints stay ordered.
                let lo_u = (self.lo as u64 & mask) >> s;
                let hi_u = (self.hi as u64 & mask) >> s;
                Self::range(self.bits, lo_u as i64, hi_u as i64)
            }
            None => Self::unrestricted(self.bits),
        }
    }

    /// Widen i32 -> i64 (sign extension preserves bounds).
    pub fn sign_extend_to(&self, to_bits: u8) -> IntStamp {
        if self.is_empty() {
            return Self::empty(to_bits);
        }
        Self::range(to_bits, self.lo, self.hi)
    }

    /// Narrow i64 -> i32; loses precision when the range does not fit.
    pub fn narrow_to(&self, to_bits: u8) -> IntStamp {
        if self.is_empty() {
            return Self::empty(to_bits);
        }
        if self.lo >= int_min(to_bits) && self.hi <= int_max(to_bits) {
            Self::range(to_bits, self.lo, self.hi)
        } else {
            Self::unrestricted(to_bits)
        }
    }

    fn from_masks(bits: u8, must: u64, may: u64) -> IntStamp {
        let (lo, hi) = if may & (1u64 << (bits - 1)) == 0 {
            // Sign bit can never be set: all values nonnegative.
            (0, sign_extend(bits, may as i64).max(0))
        } else {
            (int_min(bits), int_max(bits))
        };
        Self::create(bits, lo, hi, must, may)
    }
}

impl std::fmt::Display for IntStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "i{}<empty>", self.bits);
        }
        if let Some(c) = self.as_constant() {
            return write!(f, "i{}[{}]", self.bits, c);
        }
        write!(f, "i{}[{}..{}]", self.bits, self.lo, self.hi)?;
        if self.must_be_set != 0 || self.may_be_set != bits_mask(self.bits) {
            write!(f, " set={:#x}/{:#x}", self.must_be_set, self.may_be_set)?;
        }
        Ok(())
    }
}

// =============================================================================
// Float stamps
// =============================================================================

/// Float range plus NaN admission. A stamp that may be NaN keeps its range
/// for the non-NaN values it admits. NaN constants use the inverted-bounds
/// encoding (`+inf..-inf`, `non_nan = false`), so derived equality stays
/// total (no NaN stored in the bounds themselves).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatStamp {
    bits: u8,
    lo: f64,
    hi: f64,
    non_nan: bool,
}

impl FloatStamp {
    pub fn unrestricted(bits: u8) -> FloatStamp {
        FloatStamp {
            bits,
            lo: f64::NEG_INFINITY,
            hi: f64::INFINITY,
            non_nan: false,
        }
    }

    pub fn empty(bits: u8) -> FloatStamp {
        FloatStamp {
            bits,
            lo: f64::INFINITY,
            hi: f64::NEG_INFINITY,
            non_nan: true,
        }
    }

    pub fn constant(bits: u8, value: f64) -> FloatStamp {
        if value.is_nan() {
            FloatStamp {
                bits,
                lo: f64::INFINITY,
                hi: f64::NEG_INFINITY,
                non_nan: false,
            }
        } else {
            FloatStamp {
                bits,
                lo: value,
                hi: value,
                non_nan: true,
            }
        }
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.lo > self.hi && self.non_nan
    }

    pub fn as_constant(&self) -> Option<f64> {
        if self.non_nan && self.lo == self.hi {
            Some(self.lo)
        } else if !self.non_nan && self.lo > self.hi {
            Some(f64::NAN)
        } else {
            None
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        if value.is_nan() {
            !self.non_nan
        } else {
            self.lo <= value && value <= self.hi
        }
    }

    pub fn meet(&self, other: &FloatStamp) -> FloatStamp {
        debug_assert_eq!(self.bits, other.bits);
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        FloatStamp {
            bits: self.bits,
            lo: self.lo.min(other.lo),
            hi: self.hi.max(other.hi),
            non_nan: self.non_nan && other.non_nan,
        }
    }

    pub fn join(&self, other: &FloatStamp) -> FloatStamp {
        debug_assert_eq!(self.bits, other.bits);
        let lo = self.lo.max(other.lo);
        let hi = self.hi.min(other.hi);
        let non_nan = self.non_nan || other.non_nan;
        if lo > hi && non_nan {
            Self::empty(self.bits)
        } else {
            FloatStamp {
                bits: self.bits,
                lo,
                hi,
                non_nan,
            }
        }
    }
}

impl std::fmt::Display for FloatStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "f{}<empty>", self.bits);
        }
        write!(f, "f{}[{}..{}]", self.bits, self.lo, self.hi)?;
        if !self.non_nan {
            write!(f, "|NaN")?;
        }
        Ok(())
    }
}

// =============================================================================
// Reference stamps
// =============================================================================

/// Managed reference: nullness facts plus an optional exact dynamic class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefStamp {
    non_null: bool,
    always_null: bool,
    exact_class: Option<ClassId>,
}

impl RefStamp {
    pub fn unrestricted() -> RefStamp {
        RefStamp {
            non_null: false,
            always_null: false,
            exact_class: None,
        }
    }

    pub fn empty() -> RefStamp {
        RefStamp {
            non_null: true,
            always_null: true,
            exact_class: None,
        }
    }

    pub fn null() -> RefStamp {
        RefStamp {
            non_null: false,
            always_null: true,
            exact_class: None,
        }
    }

    /// A freshly allocated instance: non-null with known exact class.
    pub fn exact_non_null(class: ClassId) -> RefStamp {
        RefStamp {
            non_null: true,
            always_null: false,
            exact_class: Some(class),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.non_null && self.always_null
    }

    pub fn is_non_null(&self) -> bool {
        self.non_null
    }

    pub fn is_always_null(&self) -> bool {
        self.always_null && !self.non_null
    }

    pub fn exact_class(&self) -> Option<ClassId> {
        self.exact_class
    }

    pub fn meet(&self, other: &RefStamp) -> RefStamp {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        // Null carries no class, so a null side keeps the other's class hint.
        let exact_class = if self.is_always_null() {
            other.exact_class
        } else if other.is_always_null() {
            self.exact_class
        } else if self.exact_class == other.exact_class {
            self.exact_class
        } else {
            None
        };
        RefStamp {
            non_null: self.non_null && other.non_null,
            always_null: self.always_null && other.always_null,
            exact_class,
        }
    }

    pub fn join(&self, other: &RefStamp) -> RefStamp {
        let non_null = self.non_null || other.non_null;
        let always_null = self.always_null || other.always_null;
        let exact_class = match (self.exact_class, other.exact_class) {
            (Some(a), Some(b)) if a != b => return RefStamp::empty(),
            (Some(a), _) => Some(a),
            (_, b) => b,
        };
        if non_null && always_null {
            return RefStamp::empty();
        }
        RefStamp {
            non_null,
            always_null,
            exact_class,
        }
    }
}

impl std::fmt::Display for RefStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "ref<empty>");
        }
        if self.is_always_null() {
            return write!(f, "ref[null]");
        }
        write!(f, "ref")?;
        if self.non_null {
            write!(f, "!")?;
        }
        if let Some(c) = self.exact_class {
            write!(f, "[{c}]")?;
        }
        Ok(())
    }
}

// =============================================================================
// Stamp
// =============================================================================

/// The per-kind lattice element carried by every value-producing node.
/// `Void` is the stamp of control and effect-only nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stamp {
    Int(IntStamp),
    Float(FloatStamp),
    Ref(RefStamp),
    /// Untracked machine pointer (off-heap data, runtime structures).
    RawPtr,
    Void,
}

impl Stamp {
    pub fn int32() -> Stamp {
        Stamp::Int(IntStamp::unrestricted(32))
    }

    pub fn int64() -> Stamp {
        Stamp::Int(IntStamp::unrestricted(64))
    }

    pub fn object() -> Stamp {
        Stamp::Ref(RefStamp::unrestricted())
    }

    pub fn constant_int(bits: u8, value: i64) -> Stamp {
        Stamp::Int(IntStamp::constant(bits, value))
    }

    pub fn constant_bool(value: bool) -> Stamp {
        Stamp::constant_int(32, value as i64)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Stamp::Int(s) => s.is_empty(),
            Stamp::Float(s) => s.is_empty(),
            Stamp::Ref(s) => s.is_empty(),
            Stamp::RawPtr | Stamp::Void => false,
        }
    }

    /// Two stamps of different kinds never meet/join; the graph is typed and
    /// a cross-kind combination is a bug in the phase that asked.
    pub fn same_kind(&self, other: &Stamp) -> bool {
        match (self, other) {
            (Stamp::Int(a), Stamp::Int(b)) => a.bits() == b.bits(),
            (Stamp::Float(a), Stamp::Float(b)) => a.bits() == b.bits(),
            (Stamp::Ref(_), Stamp::Ref(_)) => true,
            (Stamp::RawPtr, Stamp::RawPtr) => true,
            (Stamp::Void, Stamp::Void) => true,
            _ => false,
        }
    }

    pub fn meet(&self, other: &Stamp) -> Stamp {
        opal_core::guarantee!(
            self.same_kind(other),
            "meet of mismatched stamp kinds: {self} vs {other}"
        );
        match (self, other) {
            (Stamp::Int(a), Stamp::Int(b)) => Stamp::Int(a.meet(b)),
            (Stamp::Float(a), Stamp::Float(b)) => Stamp::Float(a.meet(b)),
            (Stamp::Ref(a), Stamp::Ref(b)) => Stamp::Ref(a.meet(b)),
            _ => *self,
        }
    }

    pub fn join(&self, other: &Stamp) -> Stamp {
        opal_core::guarantee!(
            self.same_kind(other),
            "join of mismatched stamp kinds: {self} vs {other}"
        );
        match (self, other) {
            (Stamp::Int(a), Stamp::Int(b)) => Stamp::Int(a.join(b)),
            (Stamp::Float(a), Stamp::Float(b)) => Stamp::Float(a.join(b)),
            (Stamp::Ref(a), Stamp::Ref(b)) => Stamp::Ref(a.join(b)),
            _ => *self,
        }
    }

    pub fn as_int(&self) -> Option<&IntStamp> {
        match self {
            Stamp::Int(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<&FloatStamp> {
        match self {
            Stamp::Float(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ref_stamp(&self) -> Option<&RefStamp> {
        match self {
            Stamp::Ref(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stamp::Int(s) => write!(f, "{s}"),
            Stamp::Float(s) => write!(f, "{s}"),
            Stamp::Ref(s) => write!(f, "{s}"),
            Stamp::RawPtr => write!(f, "ptr"),
            Stamp::Void => write!(f, "void"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_is_singleton() {
        let s = IntStamp::constant(32, 42);
        assert_eq!(s.as_constant(), Some(42));
        assert!(s.contains(42));
        assert!(!s.contains(41));
        assert_eq!(s.must_be_set(), 42);
        assert_eq!(s.may_be_set(), 42);
    }

    #[test]
    fn test_negative_constant_masks() {
        let s = IntStamp::constant(32, -1);
        assert_eq!(s.must_be_set(), 0xFFFF_FFFF);
        assert_eq!(s.may_be_set(), 0xFFFF_FFFF);
        assert!(s.contains(-1));
    }

    #[test]
    fn test_range_mask_derivation() {
        // [8, 11]: bit 3 fixed, bits 0-1 vary, bit 2 never set.
        let s = IntStamp::range(32, 8, 11);
        assert_eq!(s.must_be_set(), 0b1000);
        assert_eq!(s.may_be_set(), 0b1011);
        for v in 8..=11 {
            assert!(s.contains(v), "{v} should be admitted");
        }
        assert!(!s.contains(12));
    }

    #[test]
    fn test_mask_refines_bounds() {
        // Range says [0, 100] but bit 0 must be set: 0 is impossible.
        let s = IntStamp::create(32, 0, 100, 0b1, bits_mask(32));
        assert!(s.lo() >= 1);
        assert!(!s.contains(0));
        assert!(s.contains(1));
    }

    #[test]
    fn test_contradiction_collapses_to_empty() {
        let s = IntStamp::create(32, 10, 5, 0, u64::MAX);
        assert!(s.is_empty());
        let s = IntStamp::create(32, 0, 10, 0b100, 0b011);
        assert!(s.is_empty());
    }

    #[test]
    fn test_meet_widens() {
        let a = IntStamp::constant(32, 3);
        let b = IntStamp::constant(32, 12);
        let m = a.meet(&b);
        assert!(m.contains(3));
        assert!(m.contains(12));
        assert_eq!(m.lo(), 3);
        assert_eq!(m.hi(), 12);
    }

    #[test]
    fn test_join_narrows_to_empty_when_disjoint() {
        let a = IntStamp::range(32, 0, 5);
        let b = IntStamp::range(32, 10, 20);
        assert!(a.join(&b).is_empty());
        assert!(a.never_eq(&b));
        assert!(a.always_lt(&b));
    }

    #[test]
    fn test_meet_with_empty_is_identity() {
        let a = IntStamp::range(32, 1, 9);
        let e = IntStamp::empty(32);
        assert_eq!(a.meet(&e), a);
        assert_eq!(e.meet(&a), a);
    }

    #[test]
    fn test_add_transfer() {
        let a = IntStamp::range(32, 1, 10);
        let b = IntStamp::constant(32, 5);
        let sum = a.add(&b);
        assert_eq!(sum.lo(), 6);
        assert_eq!(sum.hi(), 15);
    }

    #[test]
    fn test_add_overflow_goes_unrestricted() {
        let a = IntStamp::constant(32, i32::MAX as i64);
        let b = IntStamp::constant(32, 1);
        assert!(a.add(&b).is_unrestricted());
    }

    #[test]
    fn test_and_mask_bounds() {
        let a = IntStamp::unrestricted(32);
        let b = IntStamp::constant(32, 0xFF);
        let r = a.and(&b);
        assert_eq!(r.lo(), 0);
        assert_eq!(r.hi(), 0xFF);
    }

    #[test]
    fn test_xor_self_cancels_to_zeroable() {
        let a = IntStamp::constant(32, 0b1010);
        let r = a.xor(&a);
        assert_eq!(r.as_constant(), Some(0));
    }

    #[test]
    fn test_shift_by_constant() {
        let a = IntStamp::range(32, 1, 4);
        let s = IntStamp::constant(32, 2);
        let r = a.shl(&s);
        assert_eq!(r.lo(), 4);
        assert_eq!(r.hi(), 16);
        let r = IntStamp::range(32, 16, 64).shr(&s);
        assert_eq!(r.lo(), 4);
        assert_eq!(r.hi(), 16);
    }

    #[test]
    fn test_narrow_and_widen() {
        let a = IntStamp::range(64, -7, 9);
        let narrowed = a.narrow_to(32);
        assert_eq!((narrowed.lo(), narrowed.hi()), (-7, 9));
        let widened = narrowed.sign_extend_to(64);
        assert_eq!((widened.lo(), widened.hi()), (-7, 9));

        let wide = IntStamp::range(64, 0, i64::MAX);
        assert!(wide.narrow_to(32).is_unrestricted());
    }

    #[test]
    fn test_float_nan_constant() {
        let s = FloatStamp::constant(64, f64::NAN);
        assert!(s.contains(f64::NAN));
        assert!(!s.contains(0.0));
        assert!(s.as_constant().unwrap().is_nan());
    }

    #[test]
    fn test_float_meet_keeps_nan_admission() {
        let a = FloatStamp::constant(64, 1.0);
        let nan = FloatStamp::constant(64, f64::NAN);
        let m = a.meet(&nan);
        assert!(m.contains(1.0));
        assert!(m.contains(f64::NAN));
    }

    #[test]
    fn test_ref_lattice() {
        let null = RefStamp::null();
        let obj = RefStamp::exact_non_null(ClassId(3));
        let m = null.meet(&obj);
        assert!(!m.is_non_null());
        assert!(!m.is_always_null());
        assert_eq!(m.exact_class(), Some(ClassId(3)));

        let j = RefStamp::unrestricted().join(&obj);
        assert!(j.is_non_null());
        assert_eq!(j.exact_class(), Some(ClassId(3)));

        // null join non-null is a contradiction.
        assert!(null.join(&obj).is_empty());
    }

    #[test]
    fn test_ref_class_conflict_is_empty() {
        let a = RefStamp::exact_non_null(ClassId(1));
        let b = RefStamp::exact_non_null(ClassId(2));
        assert!(a.join(&b).is_empty());
        assert_eq!(a.meet(&b).exact_class(), None);
    }

    #[test]
    fn test_stamp_kind_mismatch_panics() {
        let result = std::panic::catch_unwind(|| {
            Stamp::int32().meet(&Stamp::int64());
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_bool_stamp() {
        let b = IntStamp::bool_range();
        assert!(b.contains(0));
        assert!(b.contains(1));
        assert!(!b.contains(2));
    }
}
